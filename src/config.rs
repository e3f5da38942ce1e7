//! Client configuration, loaded from an optional TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// External audio player invocation. The audio URL is appended as the last
/// argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            program: "mpv".to_string(),
            args: vec!["--no-video".to_string(), "--really-quiet".to_string()],
        }
    }
}

/// Every knob of the chat client. All keys are optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend host every endpoint is relative to.
    pub base_url: String,
    /// Label shown in front of bot replies.
    pub bot_name: String,
    /// Delay between revealed characters of a bot reply.
    pub typing_tick_ms: u64,
    /// How long a mirrored stream message stays before it starts fading.
    pub spectator_display_ms: u64,
    pub spectator_fade_ms: u64,
    pub idle_enabled: bool,
    pub idle_threshold_secs: u64,
    pub idle_check_interval_secs: u64,
    pub keystroke_window_ms: u64,
    /// POST `/stop` before every `/generate`, discarding stale backend work.
    pub stop_backend_before_generate: bool,
    pub stream_enabled: bool,
    pub stream_retry_secs: u64,
    pub speech_enabled: bool,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub player: PlayerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            bot_name: "RenAI".to_string(),
            typing_tick_ms: 50,
            spectator_display_ms: 10_000,
            spectator_fade_ms: 1_000,
            idle_enabled: true,
            idle_threshold_secs: 60,
            idle_check_interval_secs: 5,
            keystroke_window_ms: 3_000,
            stop_backend_before_generate: true,
            stream_enabled: true,
            stream_retry_secs: 3,
            speech_enabled: true,
            connect_timeout_secs: 3,
            request_timeout_secs: 60,
            player: PlayerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the client spin or never fire.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(ChatError::Config("base_url must not be empty".into()));
        }
        if self.typing_tick_ms == 0 {
            return Err(ChatError::Config("typing_tick_ms must be > 0".into()));
        }
        if self.idle_check_interval_secs == 0 {
            return Err(ChatError::Config("idle_check_interval_secs must be > 0".into()));
        }
        if self.player.program.trim().is_empty() {
            return Err(ChatError::Config("player.program must not be empty".into()));
        }
        Ok(())
    }

    pub fn typing_tick(&self) -> Duration {
        Duration::from_millis(self.typing_tick_ms)
    }

    pub fn spectator_display(&self) -> Duration {
        Duration::from_millis(self.spectator_display_ms)
    }

    pub fn spectator_fade(&self) -> Duration {
        Duration::from_millis(self.spectator_fade_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn keystroke_window(&self) -> Duration {
        Duration::from_millis(self.keystroke_window_ms)
    }

    pub fn stream_retry(&self) -> Duration {
        Duration::from_secs(self.stream_retry_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
