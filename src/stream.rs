//! The live chat subscription: `/twitch_chat_stream` as Server-Sent Events.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::controller::Ingress;
use crate::error::{ChatError, Result};
use crate::gateway::RequestGateway;
use crate::wire::StreamChatEvent;

/// Consecutive connect failures after which the pump logs at `error`.
const LOUD_FAILURE_THRESHOLD: u32 = 5;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Incremental SSE decoder yielding the payload of every `data:` line.
///
/// Bytes are buffered until a full line is available, so chunks split
/// mid-line (or mid-character) decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the data payloads of every completed line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(line_end) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
            // Blank separators, comments and event/id/retry fields carry nothing we use.
        }

        payloads
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// An open subscription. Each call to [`next_event`](Self::next_event)
/// yields the next pushed `(user, message)` pair; once it returns `None` the
/// stream is finished and cannot be restarted.
pub struct ChatStream {
    url: String,
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<String>,
}

impl ChatStream {
    /// Wrap any byte stream carrying an SSE body.
    pub fn from_byte_stream(
        url: impl Into<String>,
        body: impl Stream<Item = Result<Vec<u8>>> + Send + 'static,
    ) -> Self {
        Self {
            url: url.into(),
            body: Box::pin(body),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next event, `Some(Err(_))` on a network failure, `None` at end of stream.
    ///
    /// Payloads that are not a `{user, message}` object are logged and skipped.
    pub async fn next_event(&mut self) -> Option<Result<StreamChatEvent>> {
        loop {
            while let Some(payload) = self.pending.pop_front() {
                match serde_json::from_str::<StreamChatEvent>(&payload) {
                    Ok(event) => return Some(Ok(event)),
                    Err(e) => warn!(url = %self.url, error = %e, "skipping malformed chat stream payload"),
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => {
                    let payloads = self.decoder.push(&chunk);
                    self.pending.extend(payloads);
                }
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

impl RequestGateway {
    /// GET `/twitch_chat_stream` and hand back the live subscription.
    ///
    /// The request is exempt from the per-request timeout; it stays open for
    /// as long as the server keeps it open.
    pub async fn open_chat_stream(&self) -> Result<ChatStream> {
        let url = self.endpoint("/twitch_chat_stream");
        let resp = self
            .stream_client()
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ChatError::Transport {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ChatError::Status {
                status: resp.status().as_u16(),
                url,
                detail: None,
            });
        }

        let err_url = url.clone();
        let body = resp.bytes_stream().map(move |chunk| {
            chunk.map(|b| b.to_vec()).map_err(|e| ChatError::Transport {
                url: err_url.clone(),
                detail: e.to_string(),
            })
        });

        Ok(ChatStream::from_byte_stream(url, body))
    }
}

/// Forward every stream event to the controller as [`Ingress::StreamMessage`].
///
/// When the subscription ends or fails the pump reconnects after
/// `retry_delay`. Returns once the controller's ingress channel is closed.
pub async fn pump_chat_stream(
    gateway: RequestGateway,
    ingress: mpsc::Sender<Ingress>,
    retry_delay: Duration,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        match gateway.open_chat_stream().await {
            Ok(mut stream) => {
                consecutive_failures = 0;
                info!(url = %stream.url(), "chat stream connected");

                while let Some(item) = stream.next_event().await {
                    match item {
                        Ok(event) => {
                            if ingress.send(Ingress::StreamMessage(event)).await.is_err() {
                                debug!("controller gone, chat stream pump exiting");
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "chat stream interrupted");
                            break;
                        }
                    }
                }
                debug!("chat stream closed by server");
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);

                if consecutive_failures >= LOUD_FAILURE_THRESHOLD {
                    error!(
                        error = %e,
                        url = %gateway.base_url(),
                        consecutive_failures,
                        "chat stream connect failed repeatedly, will retry"
                    );
                } else {
                    warn!(error = %e, url = %gateway.base_url(), "chat stream connect failed, will retry");
                }
            }
        }

        if ingress.is_closed() {
            return;
        }
        tokio::time::sleep(retry_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>>> = parts.iter().map(|p| Ok(p.to_vec())).collect();
        tokio_stream::iter(owned)
    }

    #[test]
    fn decoder_single_event() {
        let mut d = SseDecoder::new();
        let out = d.push(b"data: {\"user\":\"a\",\"message\":\"hi\"}\n\n");
        assert_eq!(out, vec![r#"{"user":"a","message":"hi"}"#.to_string()]);
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn decoder_line_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: {\"user\":").is_empty());
        assert!(d.pending_len() > 0);
        let out = d.push(b"\"a\",\"message\":\"hi\"}\n");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn decoder_multibyte_char_split_across_chunks() {
        let mut d = SseDecoder::new();
        let line = "data: caf\u{e9}\n".as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let split = line.len() - 2;
        assert!(d.push(&line[..split]).is_empty());
        assert_eq!(d.push(&line[split..]), vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn decoder_handles_crlf_and_no_space() {
        let mut d = SseDecoder::new();
        assert_eq!(d.push(b"data:x\r\n\r\n"), vec!["x".to_string()]);
    }

    #[test]
    fn decoder_ignores_comments_and_fields() {
        let mut d = SseDecoder::new();
        let out = d.push(b": keepalive\nevent: chat\nid: 7\nretry: 1000\n\ndata: y\n");
        assert_eq!(out, vec!["y".to_string()]);
    }

    #[test]
    fn decoder_skips_empty_data() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data:\ndata: \n").is_empty());
    }

    #[tokio::test]
    async fn chat_stream_yields_events_in_order() {
        let mut s = ChatStream::from_byte_stream(
            "test",
            chunks(&[
                b"data: {\"user\":\"a\",\"message\":\"one\"}\n\ndata: {\"user\":\"b\",",
                b"\"message\":\"two\"}\n\n",
            ]),
        );
        let first = s.next_event().await.unwrap().unwrap();
        assert_eq!(first, StreamChatEvent { user: "a".into(), message: "one".into() });
        let second = s.next_event().await.unwrap().unwrap();
        assert_eq!(second.user, "b");
        assert!(s.next_event().await.is_none());
    }

    #[tokio::test]
    async fn chat_stream_skips_malformed_payload() {
        let mut s = ChatStream::from_byte_stream(
            "test",
            chunks(&[b"data: not json\n\ndata: {\"user\":\"c\",\"message\":\"ok\"}\n\n"]),
        );
        let ev = s.next_event().await.unwrap().unwrap();
        assert_eq!(ev.user, "c");
        assert!(s.next_event().await.is_none());
    }

    #[tokio::test]
    async fn chat_stream_surfaces_network_error() {
        let items: Vec<Result<Vec<u8>>> = vec![Err(ChatError::Transport {
            url: "u".into(),
            detail: "reset".into(),
        })];
        let mut s = ChatStream::from_byte_stream("test", tokio_stream::iter(items));
        let err = s.next_event().await.unwrap().unwrap_err();
        assert!(err.is_transport());
    }
}
