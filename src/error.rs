//! Error types for the chat session engine.

/// Crate-level error type.
///
/// Transport-class variants (`Transport`, `Status`, `Decode`) are the only
/// ones ever shown in the chat log; everything else is logged or swallowed
/// by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// A TCP-level or mid-body network failure.
    #[error("request to {url} failed: {detail}")]
    Transport { url: String, detail: String },

    /// The backend replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}{}", fmt_detail(.detail))]
    Status {
        status: u16,
        url: String,
        detail: Option<String>,
    },

    /// The response body was not the expected JSON shape.
    #[error("invalid response body: {0}")]
    Decode(String),

    /// The request was cancelled before it completed.
    #[error("request aborted")]
    Aborted,

    /// The audio player failed to start or exited abnormally.
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_detail(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

impl ChatError {
    /// True for failures of the HTTP round trip itself (network, status, body).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::Transport { .. } | ChatError::Status { .. } | ChatError::Decode(_)
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ChatError::Aborted)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChatError>;
