//! HTTP client for the chat backend.
//!
//! Every operation is a single JSON-over-HTTP round trip against one backend
//! host. Generation calls take the owning Turn's [`CancellationToken`]; when
//! it fires the request future is dropped and the call resolves to
//! [`ChatError::Aborted`].

use std::future::Future;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::wire::{ErrorBody, GenerateRequest, GenerateResponse, TtsRequest, TtsResponse};

/// Longest raw (non-JSON) error body echoed into an error message.
const MAX_RAW_ERROR_DETAIL: usize = 200;

/// Body-less control endpoints whose responses are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Cancel any in-flight backend work.
    Stop,
    ResetAutoConversationTimer,
    PauseAutoConversation,
}

impl ControlOp {
    pub fn path(self) -> &'static str {
        match self {
            ControlOp::Stop => "/stop",
            ControlOp::ResetAutoConversationTimer => "/reset_auto_conversation_timer",
            ControlOp::PauseAutoConversation => "/pause_auto_conversation",
        }
    }
}

impl std::fmt::Display for ControlOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Timeouts and target of a [`RequestGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the backend (e.g. `http://127.0.0.1:5000`).
    pub base_url: String,
    /// TCP connection timeout, shared by every request.
    pub connect_timeout: Duration,
    /// Whole-request timeout for POST round trips. The chat stream is exempt.
    pub request_timeout: Duration,
}

impl GatewayConfig {
    /// Create a config with defaults: 3 s connect, 60 s per request.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Cloneable handle on the backend. Clones share the connection pool.
#[derive(Debug, Clone)]
pub struct RequestGateway {
    config: GatewayConfig,
    base: Url,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl RequestGateway {
    /// Start building a gateway aimed at `base_url`.
    pub fn builder(base_url: impl Into<String>) -> RequestGatewayBuilder {
        RequestGatewayBuilder::new(base_url)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::builder(config.base_url.clone())
            .connect_timeout(config.connect_timeout())
            .request_timeout(config.request_timeout())
            .build()
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Absolute URL of a backend path.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Resolve a (possibly relative) locator returned by the backend.
    pub fn resolve(&self, locator: &str) -> Result<String> {
        self.base
            .join(locator)
            .map(|u| u.to_string())
            .map_err(|e| ChatError::Decode(format!("bad locator '{locator}': {e}")))
    }

    pub(crate) fn stream_client(&self) -> &reqwest::Client {
        &self.stream_client
    }

    /// POST `/generate` with `{prompt}` and return the reply text.
    ///
    /// # Errors
    /// - `ChatError::Aborted` when `cancel` fires first.
    /// - `ChatError::Transport` / `Status` / `Decode` on a failed round trip.
    pub async fn generate_reply(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let url = self.endpoint("/generate");
        abortable(cancel, async {
            let resp = self
                .send(self.client.post(&url).json(&GenerateRequest { prompt }), &url)
                .await?;
            let body: GenerateResponse = decode(resp, &url).await?;
            Ok(body.text)
        })
        .await
    }

    /// POST `/generate_auto_message` and return the idle-triggered reply.
    pub async fn generate_auto_message(&self, cancel: &CancellationToken) -> Result<String> {
        let url = self.endpoint("/generate_auto_message");
        abortable(cancel, async {
            let resp = self.send(self.client.post(&url), &url).await?;
            let body: GenerateResponse = decode(resp, &url).await?;
            Ok(body.text)
        })
        .await
    }

    /// POST `/tts` with already-sanitized `text`; returns the absolute audio URL.
    pub async fn synthesize_speech(&self, text: &str) -> Result<String> {
        let url = self.endpoint("/tts");
        let resp = self
            .send(self.client.post(&url).json(&TtsRequest { text }), &url)
            .await?;
        let body: TtsResponse = decode(resp, &url).await?;
        self.resolve(&body.audio_url)
    }

    /// POST a body-less control endpoint. The response body is ignored.
    pub async fn control(&self, op: ControlOp) -> Result<()> {
        let url = self.endpoint(op.path());
        self.send(self.client.post(&url), &url).await?;
        Ok(())
    }

    pub async fn stop_backend(&self) -> Result<()> {
        self.control(ControlOp::Stop).await
    }

    pub async fn reset_auto_conversation_timer(&self) -> Result<()> {
        self.control(ControlOp::ResetAutoConversationTimer).await
    }

    pub async fn pause_auto_conversation(&self) -> Result<()> {
        self.control(ControlOp::PauseAutoConversation).await
    }

    /// Issue `op` in the background; failures are logged and otherwise dropped.
    pub fn spawn_control(&self, op: ControlOp) {
        let gateway = self.clone();
        tokio::spawn(async move {
            match gateway.control(op).await {
                Ok(()) => debug!(op = %op, "control request sent"),
                // Auto-conversation endpoints are optional on older backends.
                Err(e) if op != ControlOp::Stop => debug!(op = %op, error = %e, "control request failed"),
                Err(e) => warn!(op = %op, error = %e, "control request failed"),
            }
        });
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|e| ChatError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = resp.text().await.ok().and_then(|body| error_detail(&body));
            return Err(ChatError::Status {
                status,
                url: url.to_string(),
                detail,
            });
        }

        Ok(resp)
    }
}

/// Race `fut` against `cancel`; cancellation wins ties.
async fn abortable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::Aborted),
        res = fut => res,
    }
}

async fn decode<R: DeserializeOwned>(resp: reqwest::Response, url: &str) -> Result<R> {
    let bytes = resp.bytes().await.map_err(|e| ChatError::Transport {
        url: url.to_string(),
        detail: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| ChatError::Decode(e.to_string()))
}

/// Pull a human-readable reason out of an error response body.
fn error_detail(body: &str) -> Option<String> {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return Some(parsed.error);
    }
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_RAW_ERROR_DETAIL || trimmed.starts_with('<') {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Builder for [`RequestGateway`].
pub struct RequestGatewayBuilder {
    config: GatewayConfig,
}

impl RequestGatewayBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: GatewayConfig::new(base_url),
        }
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout (default 60 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Consume the builder and construct a [`RequestGateway`].
    ///
    /// # Errors
    /// Returns `ChatError::Config` when the base URL does not parse.
    pub fn build(self) -> Result<RequestGateway> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| ChatError::Config(format!("invalid base_url '{}': {e}", self.config.base_url)))?;

        // reqwest::Client::builder() can fail in extreme environments;
        // fall back to a default client instead of failing construction.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();
        let stream_client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .build()
            .unwrap_or_default();

        Ok(RequestGateway {
            config: self.config,
            base,
            client,
            stream_client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(base: &str) -> RequestGateway {
        RequestGateway::builder(base).build().unwrap()
    }

    #[test]
    fn builder_rejects_unparseable_base_url() {
        let err = RequestGateway::builder("not a url").build().unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn builder_timeouts_set() {
        let gw = RequestGateway::builder("http://localhost:5000")
            .connect_timeout(Duration::from_secs(7))
            .request_timeout(Duration::from_secs(11))
            .build()
            .unwrap();
        assert_eq!(gw.config.connect_timeout, Duration::from_secs(7));
        assert_eq!(gw.config.request_timeout, Duration::from_secs(11));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(gateway("http://h:5000/").endpoint("/tts"), "http://h:5000/tts");
        assert_eq!(gateway("http://h:5000").endpoint("/tts"), "http://h:5000/tts");
        assert_eq!(gateway("http://h/api").endpoint("/stop"), "http://h/api/stop");
    }

    #[test]
    fn resolve_relative_audio_path() {
        let gw = gateway("http://h:5000");
        assert_eq!(
            gw.resolve("/static/response.mp3?t=1.5").unwrap(),
            "http://h:5000/static/response.mp3?t=1.5"
        );
    }

    #[test]
    fn resolve_keeps_absolute_url() {
        let gw = gateway("http://h:5000");
        assert_eq!(gw.resolve("https://cdn.example/a.mp3").unwrap(), "https://cdn.example/a.mp3");
    }

    #[test]
    fn control_paths() {
        assert_eq!(ControlOp::Stop.path(), "/stop");
        assert_eq!(ControlOp::ResetAutoConversationTimer.path(), "/reset_auto_conversation_timer");
        assert_eq!(ControlOp::PauseAutoConversation.to_string(), "/pause_auto_conversation");
    }

    #[test]
    fn error_detail_prefers_json_error_field() {
        assert_eq!(error_detail(r#"{"error":"Empty query"}"#).as_deref(), Some("Empty query"));
    }

    #[test]
    fn error_detail_short_plain_text_kept() {
        assert_eq!(error_detail("  bad gateway \n").as_deref(), Some("bad gateway"));
    }

    #[test]
    fn error_detail_drops_html_and_empty() {
        assert!(error_detail("<html><body>500</body></html>").is_none());
        assert!(error_detail("   ").is_none());
        assert!(error_detail(&"x".repeat(500)).is_none());
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_without_network() {
        // Port 9 (discard) on localhost: the request never gets a chance to run.
        let gw = gateway("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gw.generate_reply("hi", &cancel).await.unwrap_err();
        assert!(err.is_aborted());
    }
}
