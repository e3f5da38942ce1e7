//! Session-wide turn gate and the handles a stop command must reach.

use tokio_util::sync::CancellationToken;

use crate::narrator::AudioHandle;
use crate::presenter::AnimationHandle;

/// What a [`SessionState::halt`] actually interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Halted {
    /// A network request was still in flight.
    pub request_cancelled: bool,
    /// Speech was audibly playing.
    pub audio_stopped: bool,
    /// Reveal animations cut short.
    pub animations_cancelled: usize,
}

/// Single-owner state of the chat session.
///
/// Only the conversation controller holds one, so plain fields suffice.
/// `busy` is true exactly while a Turn sits between acceptance and its
/// terminal state.
#[derive(Debug, Default)]
pub struct SessionState {
    busy: bool,
    active_cancel: Option<CancellationToken>,
    active_audio: Option<AudioHandle>,
    active_animations: Vec<AnimationHandle>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session for a new Turn. Returns `false` if one is pending.
    pub fn try_begin(&mut self) -> bool {
        if self.busy {
            return false;
        }
        self.busy = true;
        true
    }

    /// Release the session. Safe to call any number of times.
    ///
    /// Drops the cancel and audio handles without firing them; reveal
    /// animations that are still running stay registered so a later stop
    /// can still cut them.
    pub fn end(&mut self) {
        self.busy = false;
        self.active_cancel = None;
        self.active_audio = None;
        self.active_animations.retain(|a| !a.is_finished());
    }

    /// Store the in-flight request's token. A previous token is cancelled.
    pub fn register_cancel(&mut self, token: CancellationToken) {
        if let Some(previous) = self.active_cancel.replace(token) {
            previous.cancel();
        }
    }

    /// Store the playing audio. A previous, still-registered handle is stopped.
    pub fn register_audio(&mut self, handle: AudioHandle) {
        if let Some(previous) = self.active_audio.replace(handle) {
            previous.stop();
        }
    }

    /// Forget the audio handle after playback ended on its own.
    pub fn release_audio(&mut self) {
        self.active_audio = None;
    }

    pub fn register_animation(&mut self, handle: AnimationHandle) {
        self.active_animations.retain(|a| !a.is_finished());
        self.active_animations.push(handle);
    }

    /// Stop path: cancel the request, silence audio, freeze every animation.
    ///
    /// Does not clear `busy`; the caller finishes with [`end`](Self::end).
    pub fn halt(&mut self) -> Halted {
        let mut halted = Halted::default();

        if let Some(token) = self.active_cancel.take() {
            halted.request_cancelled = !token.is_cancelled();
            token.cancel();
        }

        if let Some(audio) = self.active_audio.take() {
            halted.audio_stopped = audio.is_playing();
            audio.stop();
        }

        for animation in self.active_animations.drain(..) {
            if !animation.is_finished() {
                halted.animations_cancelled += 1;
            }
            animation.cancel();
        }

        halted
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn has_audio(&self) -> bool {
        self.active_audio.is_some()
    }

    pub fn has_pending_request(&self) -> bool {
        self.active_cancel.is_some()
    }

    /// Registered animations that have not yet revealed their last character.
    pub fn active_animation_count(&self) -> usize {
        self.active_animations.iter().filter(|a| !a.is_finished()).count()
    }
}
