//! Chat log rendering: instant user/system entries, typewriter bot replies,
//! and self-removing spectator entries mirrored from the live stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;

/// Shortest reveal tick; tokio intervals reject a zero period.
const MIN_TYPING_TICK: Duration = Duration::from_millis(1);

/// Who a chat log entry is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Bot => write!(f, "bot"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One entry of the chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    /// Text revealed so far. For an animating bot reply this grows per tick.
    pub text: String,
    /// Stream user name for mirrored spectator messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Removed automatically after the display duration.
    pub ephemeral: bool,
    pub fading: bool,
}

/// Change notifications for whatever draws the log (the terminal renderer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterEvent {
    /// A new entry. Animated bot replies start with empty `text`.
    Appended {
        id: u64,
        role: Role,
        text: String,
        author: Option<String>,
        animated: bool,
    },
    Revealed { id: u64, ch: char },
    RevealFinished { id: u64 },
    /// The reveal was cancelled before its last character.
    RevealHalted { id: u64 },
    Fading { id: u64 },
    Removed { id: u64 },
}

// ---------------------------------------------------------------------------
// ChatLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LogInner {
    next_id: u64,
    messages: Vec<ChatMessage>,
}

/// Shared, append-only chat log. Clones refer to the same log.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, role: Role, text: String, author: Option<String>, ephemeral: bool) -> u64 {
        let mut guard = self.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        guard.messages.push(ChatMessage {
            id,
            role,
            text,
            author,
            ephemeral,
            fading: false,
        });
        id
    }

    /// Append `ch` unless `cancel` has fired. The check happens under the
    /// log lock, which [`AnimationHandle::cancel`] also takes.
    fn reveal(&self, id: u64, ch: char, cancel: &CancellationToken) -> bool {
        let mut guard = self.lock();
        if cancel.is_cancelled() {
            return false;
        }
        match guard.messages.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.text.push(ch);
                true
            }
            None => false,
        }
    }

    fn mark_fading(&self, id: u64) -> bool {
        let mut guard = self.lock();
        match guard.messages.iter_mut().find(|m| m.id == id && m.ephemeral) {
            Some(m) => {
                m.fading = true;
                true
            }
            None => false,
        }
    }

    /// Only ephemeral entries are ever removed.
    fn remove_ephemeral(&self, id: u64) -> bool {
        let mut guard = self.lock();
        let before = guard.messages.len();
        guard.messages.retain(|m| !(m.id == id && m.ephemeral));
        guard.messages.len() != before
    }

    /// Copy of the whole log, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn find(&self, id: u64) -> Option<ChatMessage> {
        self.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries with `role`, excluding ephemeral spectator entries.
    pub fn count_role(&self, role: Role) -> usize {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.role == role && !m.ephemeral)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Typewriter reveal
// ---------------------------------------------------------------------------

/// The characters a reveal still has to show. Each `next()` is one tick.
///
/// Single use: a fresh one is built for every rendered bot reply.
#[derive(Debug, Clone)]
pub struct Typewriter {
    chars: Vec<char>,
    pos: usize,
}

impl Typewriter {
    pub fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    /// Ticks a full reveal takes.
    pub fn total(&self) -> usize {
        self.chars.len()
    }

    pub fn remaining(&self) -> usize {
        self.chars.len() - self.pos
    }
}

impl Iterator for Typewriter {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        Some(ch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

/// Handle on one running reveal.
#[derive(Debug, Clone)]
pub struct AnimationHandle {
    message_id: u64,
    cancel: CancellationToken,
    done: Arc<AtomicBool>,
    log: ChatLog,
}

impl AnimationHandle {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Stop revealing. No character is appended after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // Wait out an append that checked the token before it fired.
        drop(self.log.lock());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the reveal ran to completion or observed its cancellation.
    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Presenter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenterTimings {
    pub typing_tick: Duration,
    pub spectator_display: Duration,
    pub spectator_fade: Duration,
}

impl PresenterTimings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            typing_tick: config.typing_tick(),
            spectator_display: config.spectator_display(),
            spectator_fade: config.spectator_fade(),
        }
    }
}

/// Appends to the chat log and drives reveal / fade timers.
///
/// `render` for a bot reply spawns a tokio task and therefore must be called
/// from within a runtime.
#[derive(Debug, Clone)]
pub struct Presenter {
    log: ChatLog,
    timings: PresenterTimings,
    events: Option<mpsc::UnboundedSender<PresenterEvent>>,
}

impl Presenter {
    /// A zero `typing_tick` is raised to 1 ms.
    pub fn new(log: ChatLog, timings: PresenterTimings) -> Self {
        let timings = PresenterTimings {
            typing_tick: timings.typing_tick.max(MIN_TYPING_TICK),
            ..timings
        };
        Self {
            log,
            timings,
            events: None,
        }
    }

    /// Also publish every change on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PresenterEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn log(&self) -> &ChatLog {
        &self.log
    }

    /// Append `text` as a `role` entry. Bot replies are revealed one character
    /// per tick and return the handle of that reveal; other roles appear at once.
    pub fn render(&self, text: &str, role: Role) -> (u64, Option<AnimationHandle>) {
        if role != Role::Bot {
            let id = self.log.append(role, text.to_string(), None, false);
            emit(&self.events, PresenterEvent::Appended {
                id,
                role,
                text: text.to_string(),
                author: None,
                animated: false,
            });
            return (id, None);
        }

        let id = self.log.append(Role::Bot, String::new(), None, false);
        emit(&self.events, PresenterEvent::Appended {
            id,
            role,
            text: String::new(),
            author: None,
            animated: true,
        });

        let handle = AnimationHandle {
            message_id: id,
            cancel: CancellationToken::new(),
            done: Arc::new(AtomicBool::new(false)),
            log: self.log.clone(),
        };
        tokio::spawn(run_reveal(
            self.log.clone(),
            self.events.clone(),
            id,
            Typewriter::new(text),
            self.timings.typing_tick,
            handle.clone(),
        ));
        (id, Some(handle))
    }

    /// Mirror a live-stream message. It fades after the display duration and
    /// is removed once the fade completes; nothing cancels this.
    pub fn render_spectator(&self, user: &str, message: &str) -> u64 {
        let id = self
            .log
            .append(Role::User, message.to_string(), Some(user.to_string()), true);
        emit(&self.events, PresenterEvent::Appended {
            id,
            role: Role::User,
            text: message.to_string(),
            author: Some(user.to_string()),
            animated: false,
        });

        let log = self.log.clone();
        let events = self.events.clone();
        let timings = self.timings;
        tokio::spawn(async move {
            tokio::time::sleep(timings.spectator_display).await;
            if log.mark_fading(id) {
                emit(&events, PresenterEvent::Fading { id });
            }
            tokio::time::sleep(timings.spectator_fade).await;
            if log.remove_ephemeral(id) {
                emit(&events, PresenterEvent::Removed { id });
            }
        });
        id
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<PresenterEvent>>, event: PresenterEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

async fn run_reveal(
    log: ChatLog,
    events: Option<mpsc::UnboundedSender<PresenterEvent>>,
    id: u64,
    typewriter: Typewriter,
    tick: Duration,
    handle: AnimationHandle,
) {
    // First character lands one tick after render, like a browser interval.
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);

    for ch in typewriter {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                emit(&events, PresenterEvent::RevealHalted { id });
                return;
            }
            _ = ticker.tick() => {}
        }
        if !log.reveal(id, ch, &handle.cancel) {
            emit(&events, PresenterEvent::RevealHalted { id });
            return;
        }
        emit(&events, PresenterEvent::Revealed { id, ch });
    }

    handle.done.store(true, Ordering::Release);
    emit(&events, PresenterEvent::RevealFinished { id });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> PresenterTimings {
        PresenterTimings {
            typing_tick: Duration::from_millis(50),
            spectator_display: Duration::from_secs(10),
            spectator_fade: Duration::from_secs(1),
        }
    }

    fn text_of(log: &ChatLog, id: u64) -> String {
        log.find(id).map(|m| m.text).unwrap_or_default()
    }

    #[test]
    fn typewriter_yields_every_char_once() {
        let tw = Typewriter::new("héllo");
        assert_eq!(tw.total(), 5);
        assert_eq!(tw.size_hint(), (5, Some(5)));
        assert_eq!(tw.collect::<String>(), "héllo");
    }

    #[test]
    fn typewriter_empty_text_has_no_ticks() {
        let mut tw = Typewriter::new("");
        assert_eq!(tw.total(), 0);
        assert!(tw.next().is_none());
    }

    #[tokio::test]
    async fn user_and_system_render_immediately() {
        let p = Presenter::new(ChatLog::new(), timings());
        let (uid, h1) = p.render("hello", Role::User);
        let (sid, h2) = p.render("TTS stopped", Role::System);
        assert!(h1.is_none() && h2.is_none());
        assert_eq!(text_of(p.log(), uid), "hello");
        assert_eq!(text_of(p.log(), sid), "TTS stopped");
        assert_eq!(p.log().count_role(Role::System), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bot_reply_reveals_one_char_per_tick() {
        let p = Presenter::new(ChatLog::new(), timings());
        let (id, handle) = p.render("hello", Role::Bot);
        let handle = handle.unwrap();
        assert_eq!(text_of(p.log(), id), "");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(text_of(p.log(), id), "he");
        assert!(!handle.is_finished());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(text_of(p.log(), id), "hello");
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn n_chars_take_exactly_n_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = Presenter::new(ChatLog::new(), timings()).with_events(tx);
        let (id, _) = p.render("abcdefg", Role::Bot);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut revealed = 0;
        let mut finished = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                PresenterEvent::Revealed { id: rid, .. } if rid == id => revealed += 1,
                PresenterEvent::RevealFinished { id: rid } if rid == id => finished += 1,
                _ => {}
            }
        }
        assert_eq!(revealed, 7);
        assert_eq!(finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_freezes_reveal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = Presenter::new(ChatLog::new(), timings()).with_events(tx);
        let (id, handle) = p.render("hello world", Role::Bot);
        let handle = handle.unwrap();

        tokio::time::sleep(Duration::from_millis(170)).await;
        handle.cancel();
        let frozen = text_of(p.log(), id);
        assert_eq!(frozen, "hel");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(text_of(p.log(), id), frozen);
        assert!(handle.is_finished());

        let mut halted = false;
        while let Ok(ev) = rx.try_recv() {
            if ev == (PresenterEvent::RevealHalted { id }) {
                halted = true;
            }
        }
        assert!(halted);
    }

    #[tokio::test(start_paused = true)]
    async fn spectator_entry_fades_then_disappears() {
        let p = Presenter::new(ChatLog::new(), timings());
        let id = p.render_spectator("viewer", "hi chat");
        let entry = p.log().find(id).unwrap();
        assert!(entry.ephemeral);
        assert_eq!(entry.author.as_deref(), Some("viewer"));
        assert_eq!(p.log().count_role(Role::User), 0);

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert!(p.log().find(id).unwrap().fading);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(p.log().find(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spectator_removal_leaves_other_entries() {
        let p = Presenter::new(ChatLog::new(), timings());
        p.render("kept", Role::User);
        p.render_spectator("viewer", "temporary");
        p.render("also kept", Role::System);
        tokio::time::sleep(Duration::from_secs(12)).await;
        let texts: Vec<String> = p.log().snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["kept", "also kept"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_is_final_across_worker_threads() {
        let p = Presenter::new(
            ChatLog::new(),
            PresenterTimings {
                typing_tick: Duration::from_millis(1),
                ..timings()
            },
        );
        let text = "x".repeat(200);
        let mut late = 0;

        for _ in 0..10 {
            let renders: Vec<_> = (0..100).map(|_| p.render(&text, Role::Bot)).collect();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let frozen: Vec<(u64, usize)> = renders
                .iter()
                .map(|(id, handle)| {
                    handle.as_ref().unwrap().cancel();
                    (*id, text_of(p.log(), *id).len())
                })
                .collect();
            tokio::time::sleep(Duration::from_millis(20)).await;
            late += frozen
                .iter()
                .filter(|(id, len)| text_of(p.log(), *id).len() != *len)
                .count();
        }
        assert_eq!(late, 0, "characters appended after cancel()");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_typing_tick_is_raised_to_minimum() {
        let p = Presenter::new(
            ChatLog::new(),
            PresenterTimings {
                typing_tick: Duration::ZERO,
                ..timings()
            },
        );
        let (id, handle) = p.render("abc", Role::Bot);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(text_of(p.log(), id), "abc");
        assert!(handle.unwrap().is_finished());
    }

    #[test]
    fn role_display_lowercase() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Bot.to_string(), "bot");
        assert_eq!(Role::System.to_string(), "system");
    }
}
