//! Speech for bot replies: sanitize, synthesize through the backend, play.
//!
//! Speech is best-effort. Callers log the errors returned here; nothing in
//! this module ever writes to the chat log.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PlayerConfig;
use crate::error::{ChatError, Result};
use crate::gateway::RequestGateway;
use crate::sanitize::sanitize_for_speech;

/// Stop switch of one playback. Clones control the same playback.
#[derive(Debug, Clone, Default)]
pub struct AudioHandle {
    stop: CancellationToken,
    ended: Arc<AtomicBool>,
}

impl AudioHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Halt playback immediately.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Called by the player once playback is over, whatever the reason.
    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Audible right now: neither stopped nor ended on its own.
    pub fn is_playing(&self) -> bool {
        !self.is_stopped() && !self.has_ended()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

/// A started playback.
#[derive(Debug)]
pub struct Playback {
    handle: AudioHandle,
    finished: oneshot::Receiver<Result<()>>,
}

impl Playback {
    /// Pair a handle with the channel its player reports completion on.
    pub fn new(handle: AudioHandle, finished: oneshot::Receiver<Result<()>>) -> Self {
        Self { handle, finished }
    }

    pub fn handle(&self) -> AudioHandle {
        self.handle.clone()
    }

    /// `Ok(())` when playback ends naturally or is stopped, `Err` on player failure.
    pub async fn finished(self) -> Result<()> {
        self.finished
            .await
            .unwrap_or_else(|_| Err(ChatError::Playback("player vanished before finishing".into())))
    }
}

/// Something that can play an audio URL.
pub trait AudioPlayer: Send + Sync {
    /// Start playing `url`. Must be called from within a tokio runtime.
    ///
    /// Implementations call [`AudioHandle::mark_ended`] before reporting
    /// completion on the [`Playback`] channel.
    fn play(&self, url: &str) -> Result<Playback>;
}

/// Plays through an external program, e.g. `mpv --no-video <url>`.
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

impl AudioPlayer for CommandPlayer {
    fn play(&self, url: &str) -> Result<Playback> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChatError::Playback(format!("cannot start '{}': {e}", self.program)))?;

        let handle = AudioHandle::new();
        let stop = handle.clone();
        let (tx, rx) = oneshot::channel();
        let program = self.program.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                _ = stop.stopped() => None,
                status = child.wait() => Some(status),
            };
            let result = match status {
                None => {
                    let _ = child.kill().await;
                    debug!(program = %program, "playback stopped");
                    Ok(())
                }
                Some(Ok(s)) if s.success() => Ok(()),
                Some(Ok(s)) => Err(ChatError::Playback(format!("'{program}' exited with {s}"))),
                Some(Err(e)) => Err(ChatError::Playback(e.to_string())),
            };
            stop.mark_ended();
            let _ = tx.send(result);
        });

        Ok(Playback::new(handle, rx))
    }
}

/// Turns reply text into audible speech.
#[derive(Clone)]
pub struct Narrator {
    gateway: RequestGateway,
    player: Arc<dyn AudioPlayer>,
}

impl Narrator {
    pub fn new(gateway: RequestGateway, player: Arc<dyn AudioPlayer>) -> Self {
        Self { gateway, player }
    }

    /// Sanitize and synthesize. `Ok(None)` when nothing speakable remains.
    pub async fn synthesize(&self, text: &str) -> Result<Option<String>> {
        let clean = sanitize_for_speech(text);
        if clean.trim().is_empty() {
            debug!("reply has no speakable text after sanitization");
            return Ok(None);
        }
        self.gateway.synthesize_speech(&clean).await.map(Some)
    }

    pub fn play(&self, url: &str) -> Result<Playback> {
        self.player.play(url)
    }

    /// Synthesize, play, and wait for the end of playback.
    pub async fn speak(&self, text: &str) -> Result<()> {
        match self.synthesize(text).await? {
            Some(url) => self.play(&url)?.finished().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn audio_handle_clones_share_state() {
        let a = AudioHandle::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        assert!(b.is_playing());
        a.stop();
        assert!(b.is_stopped());
        assert!(!b.is_playing());
    }

    #[test]
    fn ended_handle_is_not_playing() {
        let a = AudioHandle::new();
        a.clone().mark_ended();
        assert!(a.has_ended());
        assert!(!a.is_stopped());
        assert!(!a.is_playing());
    }

    #[tokio::test]
    async fn playback_reports_vanished_player() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        let err = Playback::new(AudioHandle::new(), rx).finished().await.unwrap_err();
        assert!(matches!(err, ChatError::Playback(_)));
    }

    #[tokio::test]
    async fn missing_program_is_playback_error() {
        let player = CommandPlayer::new("/definitely/not/a/player", vec![]);
        let err = player.play("http://h/a.mp3").unwrap_err();
        assert!(matches!(err, ChatError::Playback(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_player_natural_end() {
        let player = CommandPlayer::new("true", vec![]);
        let playback = player.play("http://h/a.mp3").unwrap();
        let handle = playback.handle();
        playback.finished().await.unwrap();
        assert!(handle.has_ended());
        assert!(!handle.is_stopped());
        assert!(!handle.is_playing());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_player_failure_exit() {
        let player = CommandPlayer::new("false", vec![]);
        let playback = player.play("http://h/a.mp3").unwrap();
        assert!(matches!(playback.finished().await, Err(ChatError::Playback(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_player_stop_ends_promptly() {
        // `sleep 30`: the "URL" argument is the duration.
        let player = CommandPlayer::new("sleep", vec![]);
        let playback = player.play("30").unwrap();
        let handle = playback.handle();
        handle.stop();
        let res = tokio::time::timeout(Duration::from_secs(5), playback.finished()).await;
        assert!(matches!(res, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn synthesize_skips_unspeakable_text() {
        struct NeverPlays;
        impl AudioPlayer for NeverPlays {
            fn play(&self, _url: &str) -> Result<Playback> {
                panic!("must not play");
            }
        }
        // The gateway points nowhere; an emoji-only reply never reaches it.
        let gateway = RequestGateway::builder("http://127.0.0.1:9").build().unwrap();
        let narrator = Narrator::new(gateway, Arc::new(NeverPlays));
        assert!(narrator.synthesize("**\u{1F600}** ").await.unwrap().is_none());
        narrator.speak("\u{2B50}").await.unwrap();
    }
}
