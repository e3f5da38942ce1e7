use std::path::PathBuf;

use clap::Parser;

use crate::config::ClientConfig;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "renai-chat")]
#[command(version)]
#[command(about = "Terminal chat client for the RenAI backend, with typewriter replies and speech")]
pub struct Args {
    /// TOML configuration file; every key is optional
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Backend base URL, e.g. http://127.0.0.1:5000
    #[arg(long)]
    pub base_url: Option<String>,

    /// Label shown in front of bot replies
    #[arg(long)]
    pub bot_name: Option<String>,

    /// Do not subscribe to the live chat stream
    #[arg(long)]
    pub no_stream: bool,

    /// Disable idle auto-conversation Turns
    #[arg(long)]
    pub no_idle: bool,

    /// Do not synthesize or play speech
    #[arg(long)]
    pub no_speech: bool,

    /// Seconds of silence before an idle Turn starts
    #[arg(long)]
    pub idle_secs: Option<u64>,

    /// Audio player program; the audio URL is passed as its last argument
    #[arg(long)]
    pub player: Option<String>,

    /// Log filter used when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Send one message, wait for its Turn to finish, then exit
    #[arg(long, value_name = "PROMPT")]
    pub once: Option<String>,
}

impl Args {
    /// Load the configuration file (or defaults) and apply flag overrides.
    pub fn load_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Flags win over file values.
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(name) = &self.bot_name {
            config.bot_name = name.clone();
        }
        if self.no_stream {
            config.stream_enabled = false;
        }
        if self.no_idle {
            config.idle_enabled = false;
        }
        if self.no_speech {
            config.speech_enabled = false;
        }
        if let Some(secs) = self.idle_secs {
            config.idle_threshold_secs = secs;
        }
        if let Some(program) = &self.player {
            config.player.program = program.clone();
        }
        if self.once.is_some() {
            // A one-shot run must not start Turns of its own.
            config.idle_enabled = false;
            config.stream_enabled = false;
        }
    }
}
