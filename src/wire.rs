use serde::{Deserialize, Serialize};

// -- Generation -------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
}

/// Body of both `/generate` and `/generate_auto_message`.
#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
}

// -- Speech -----------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TtsRequest<'a> {
    pub text: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TtsResponse {
    pub audio_url: String,
}

// -- Errors -----------------------------------------------------------------

/// `{"error": "..."}` body the backend sends alongside 4xx/5xx statuses.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// -- Chat stream ------------------------------------------------------------

/// One message pushed by `/twitch_chat_stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChatEvent {
    pub user: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_serializes() {
        let json = serde_json::to_string(&GenerateRequest { prompt: "hello" }).expect("serialize");
        assert_eq!(json, r#"{"prompt":"hello"}"#);
    }

    #[test]
    fn test_tts_request_serializes() {
        let json = serde_json::to_string(&TtsRequest { text: "Hi there" }).expect("serialize");
        assert_eq!(json, r#"{"text":"Hi there"}"#);
    }

    #[test]
    fn test_generate_response_deserializes() {
        let resp: GenerateResponse = serde_json::from_str(r#"{"text":"Hello!"}"#).expect("deser");
        assert_eq!(resp.text, "Hello!");
    }

    #[test]
    fn test_generate_response_ignores_extra_fields() {
        let resp: GenerateResponse =
            serde_json::from_str(r#"{"text":"Hi","cached":true}"#).expect("deser");
        assert_eq!(resp.text, "Hi");
    }

    #[test]
    fn test_generate_response_missing_text_fails() {
        assert!(serde_json::from_str::<GenerateResponse>(r#"{"error":"Empty query"}"#).is_err());
    }

    #[test]
    fn test_tts_response_deserializes() {
        let json = r#"{"audio_url":"/static/response.mp3?t=1700000000.5"}"#;
        let resp: TtsResponse = serde_json::from_str(json).expect("deser");
        assert_eq!(resp.audio_url, "/static/response.mp3?t=1700000000.5");
    }

    #[test]
    fn test_error_body_deserializes() {
        let body: ErrorBody = serde_json::from_str(r#"{"error":"Internal server error"}"#).expect("deser");
        assert_eq!(body.error, "Internal server error");
    }

    #[test]
    fn test_stream_event_deserializes() {
        let json = r#"{"user":"viewer42","message":"what's new?"}"#;
        let ev: StreamChatEvent = serde_json::from_str(json).expect("deser");
        assert_eq!(ev.user, "viewer42");
        assert_eq!(ev.message, "what's new?");
    }

    #[test]
    fn test_stream_event_missing_user_fails() {
        assert!(serde_json::from_str::<StreamChatEvent>(r#"{"message":"hi"}"#).is_err());
    }
}
