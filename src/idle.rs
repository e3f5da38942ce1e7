//! Bookkeeping for system-initiated "auto conversation" Turns.
//!
//! The trigger is a pure clock comparison; the controller polls it from its
//! own ticker and passes in the current instant.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct IdleAutoTrigger {
    threshold: Duration,
    keystroke_window: Duration,
    last_input: Instant,
    deferred_until: Option<Instant>,
    enabled: bool,
}

impl IdleAutoTrigger {
    pub fn new(threshold: Duration, keystroke_window: Duration, now: Instant) -> Self {
        Self {
            threshold,
            keystroke_window,
            last_input: now,
            deferred_until: None,
            enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// A message was submitted: restart the quiet period.
    pub fn note_submit(&mut self, now: Instant) {
        self.last_input = now;
        self.deferred_until = None;
    }

    /// The user is typing: restart the quiet period and hold off for the
    /// keystroke window.
    pub fn note_keystroke(&mut self, now: Instant) {
        self.last_input = now;
        self.deferred_until = Some(now + self.keystroke_window);
    }

    /// Whether an idle Turn should start now. A `true` answer restarts the
    /// quiet period, so a missed chance (busy session) is never retried early.
    pub fn should_fire(&mut self, now: Instant, busy: bool) -> bool {
        if !self.enabled || busy {
            return false;
        }
        if let Some(until) = self.deferred_until {
            if now < until {
                return false;
            }
        }
        if now.saturating_duration_since(self.last_input) < self.threshold {
            return false;
        }
        self.last_input = now;
        self.deferred_until = None;
        true
    }
}
