//! The conversation controller: one task that owns the session and runs
//! every Turn through `Accepted → AwaitingReply → Rendering →
//! AwaitingSpeech → Done`, or to `Cancelled` on stop.
//!
//! External inputs arrive as [`Ingress`] messages. Network calls, synthesis
//! and playback run in spawned tasks that report back through an internal
//! channel tagged with their Turn id, so a result that arrives after its
//! Turn was stopped is recognised and dropped.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::gateway::{ControlOp, RequestGateway};
use crate::idle::IdleAutoTrigger;
use crate::narrator::{Narrator, Playback};
use crate::presenter::{Presenter, Role};
use crate::session::SessionState;
use crate::wire::StreamChatEvent;

/// System message appended when stop interrupts audible speech.
pub const TTS_STOPPED_MESSAGE: &str = "TTS stopped";

const INGRESS_CAPACITY: usize = 64;
const TURN_SUMMARY_CAPACITY: usize = 32;
/// Shortest idle poll period; tokio intervals reject a zero period.
const MIN_IDLE_CHECK: Duration = Duration::from_millis(1);

/// Everything that can happen to the controller from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingress {
    /// A typed message was submitted.
    Submit(String),
    /// The user is typing but has not submitted yet.
    Keystroke,
    /// A message arrived on the live chat stream.
    StreamMessage(StreamChatEvent),
    Stop,
    /// Stop, then end the controller loop.
    Shutdown,
}

/// Where a Turn's prompt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSource {
    UserTyped,
    StreamSourced,
    AutoIdle,
}

impl TurnSource {
    /// Generate failures of these Turns are shown in the chat log.
    pub fn surfaces_errors(self) -> bool {
        !matches!(self, TurnSource::AutoIdle)
    }
}

impl std::fmt::Display for TurnSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnSource::UserTyped => write!(f, "user-typed"),
            TurnSource::StreamSourced => write!(f, "stream-sourced"),
            TurnSource::AutoIdle => write!(f, "auto-idle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Accepted,
    AwaitingReply,
    Rendering,
    AwaitingSpeech,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
    Failed,
}

/// One request/response/playback cycle.
#[derive(Debug)]
pub struct Turn {
    pub id: u64,
    pub source: TurnSource,
    /// `None` for idle Turns, which ask the backend for an auto message.
    pub prompt: Option<String>,
    pub reply: Option<String>,
    pub state: TurnState,
    /// `None` while pending.
    pub outcome: Option<TurnOutcome>,
    cancel: CancellationToken,
}

impl Turn {
    fn new(id: u64, source: TurnSource, prompt: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            source,
            prompt,
            reply: None,
            state: TurnState::Accepted,
            outcome: None,
            cancel,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Published once per finished Turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSummary {
    pub id: u64,
    pub source: TurnSource,
    pub outcome: TurnOutcome,
    pub reply: Option<String>,
}

/// Reports from spawned Turn work.
#[derive(Debug)]
enum TurnEvent {
    Reply { turn: u64, result: Result<String> },
    SpeechReady { turn: u64, result: Result<Option<String>> },
    SpeechFinished { turn: u64, result: Result<()> },
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// POST `/stop` ahead of every generate call.
    pub stop_backend_before_generate: bool,
    pub idle_enabled: bool,
    pub idle_threshold: Duration,
    pub idle_check_interval: Duration,
    pub keystroke_window: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ControllerOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            stop_backend_before_generate: config.stop_backend_before_generate,
            idle_enabled: config.idle_enabled,
            idle_threshold: config.idle_threshold(),
            idle_check_interval: config.idle_check_interval(),
            keystroke_window: config.keystroke_window(),
        }
    }
}

pub struct ConversationController {
    gateway: RequestGateway,
    presenter: Presenter,
    narrator: Option<Narrator>,
    session: SessionState,
    idle: IdleAutoTrigger,
    options: ControllerOptions,
    current: Option<Turn>,
    next_turn_id: u64,
    events_tx: mpsc::UnboundedSender<TurnEvent>,
    events_rx: mpsc::UnboundedReceiver<TurnEvent>,
    busy_tx: watch::Sender<bool>,
    turns_tx: broadcast::Sender<TurnSummary>,
}

impl ConversationController {
    /// A controller without speech; add it with [`with_narrator`](Self::with_narrator).
    /// A zero `idle_check_interval` is raised to 1 ms.
    pub fn new(gateway: RequestGateway, presenter: Presenter, mut options: ControllerOptions) -> Self {
        options.idle_check_interval = options.idle_check_interval.max(MIN_IDLE_CHECK);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (busy_tx, _) = watch::channel(false);
        let (turns_tx, _) = broadcast::channel(TURN_SUMMARY_CAPACITY);
        let mut idle = IdleAutoTrigger::new(options.idle_threshold, options.keystroke_window, Instant::now());
        idle.set_enabled(options.idle_enabled);

        Self {
            gateway,
            presenter,
            narrator: None,
            session: SessionState::new(),
            idle,
            options,
            current: None,
            next_turn_id: 1,
            events_tx,
            events_rx,
            busy_tx,
            turns_tx,
        }
    }

    pub fn with_narrator(mut self, narrator: Narrator) -> Self {
        self.narrator = Some(narrator);
        self
    }

    /// Run the controller on its own task.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        let handle = ControllerHandle {
            ingress: ingress_tx,
            busy: self.busy_tx.subscribe(),
            turns: self.turns_tx.clone(),
        };
        let join = tokio::spawn(self.run(ingress_rx));
        (handle, join)
    }

    /// Event loop. Returns on [`Ingress::Shutdown`] or when every sender is gone.
    pub async fn run(mut self, mut ingress: mpsc::Receiver<Ingress>) {
        let mut idle_ticker = tokio::time::interval(self.options.idle_check_interval);
        idle_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                msg = ingress.recv() => {
                    let Some(msg) = msg else {
                        self.stop(false);
                        break;
                    };
                    if !self.dispatch(msg) {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_turn_event(event),
                _ = idle_ticker.tick() => self.on_idle_tick(),
            }
        }
        debug!("conversation controller stopped");
    }

    /// Single ingress point. Returns `false` when the loop should end.
    fn dispatch(&mut self, msg: Ingress) -> bool {
        match msg {
            Ingress::Submit(text) => self.on_submit(&text),
            Ingress::Keystroke => self.on_keystroke(),
            Ingress::StreamMessage(event) => self.on_stream_message(event),
            Ingress::Stop => self.stop(true),
            Ingress::Shutdown => {
                self.stop(false);
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Turn sources
    // -----------------------------------------------------------------------

    fn on_submit(&mut self, text: &str) {
        let prompt = text.trim();
        if prompt.is_empty() {
            return;
        }

        self.idle.note_submit(Instant::now());
        self.gateway.spawn_control(ControlOp::ResetAutoConversationTimer);

        if !self.session.try_begin() {
            debug!("turn in progress, typed input dropped");
            return;
        }
        self.presenter.render(prompt, Role::User);
        self.start_turn(TurnSource::UserTyped, Some(prompt.to_string()));
    }

    fn on_keystroke(&mut self) {
        self.idle.note_keystroke(Instant::now());
        self.gateway.spawn_control(ControlOp::PauseAutoConversation);
    }

    fn on_stream_message(&mut self, event: StreamChatEvent) {
        self.presenter.render_spectator(&event.user, &event.message);

        let prompt = event.message.trim();
        if prompt.is_empty() {
            return;
        }
        if !self.session.try_begin() {
            debug!(user = %event.user, "turn in progress, stream message dropped");
            return;
        }
        self.start_turn(TurnSource::StreamSourced, Some(prompt.to_string()));
    }

    fn on_idle_tick(&mut self) {
        if !self.idle.should_fire(Instant::now(), self.session.is_busy()) {
            return;
        }
        if !self.session.try_begin() {
            return;
        }
        self.start_turn(TurnSource::AutoIdle, None);
    }

    // -----------------------------------------------------------------------
    // Turn lifecycle
    // -----------------------------------------------------------------------

    /// `Accepted → AwaitingReply`. The session must already be claimed.
    fn start_turn(&mut self, source: TurnSource, prompt: Option<String>) {
        let id = self.next_turn_id;
        self.next_turn_id += 1;

        let cancel = CancellationToken::new();
        self.session.register_cancel(cancel.clone());
        let mut turn = Turn::new(id, source, prompt.clone(), cancel.clone());
        info!(turn = id, source = %source, "turn accepted");
        self.publish_busy();

        let gateway = self.gateway.clone();
        let tx = self.events_tx.clone();
        let pre_stop = self.options.stop_backend_before_generate;
        tokio::spawn(async move {
            if pre_stop {
                if let Err(e) = gateway.stop_backend().await {
                    debug!(turn = id, error = %e, "pre-generate stop failed");
                }
            }
            let result = match prompt {
                Some(p) => gateway.generate_reply(&p, &cancel).await,
                None => gateway.generate_auto_message(&cancel).await,
            };
            let _ = tx.send(TurnEvent::Reply { turn: id, result });
        });

        turn.state = TurnState::AwaitingReply;
        self.current = Some(turn);
    }

    fn on_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Reply { turn, result } => self.on_reply(turn, result),
            TurnEvent::SpeechReady { turn, result } => self.on_speech_ready(turn, result),
            TurnEvent::SpeechFinished { turn, result } => self.on_speech_finished(turn, result),
        }
    }

    /// The live, uncancelled Turn with this id.
    fn live_turn(&mut self, id: u64) -> Option<&mut Turn> {
        self.current
            .as_mut()
            .filter(|t| t.id == id && !t.cancel.is_cancelled())
    }

    fn on_reply(&mut self, id: u64, result: Result<String>) {
        let Some(turn) = self.live_turn(id) else {
            debug!(turn = id, "discarding reply of a finished turn");
            return;
        };
        let source = turn.source;

        match result {
            Ok(text) => {
                turn.reply = Some(text.clone());
                turn.state = TurnState::Rendering;
                let (_, animation) = self.presenter.render(&text, Role::Bot);
                if let Some(animation) = animation {
                    self.session.register_animation(animation);
                }
                self.begin_speech(id, text);
            }
            Err(e) if e.is_aborted() => self.finish(TurnOutcome::Aborted),
            Err(e) => {
                warn!(turn = id, source = %source, error = %e, "generate failed");
                if source.surfaces_errors() {
                    self.presenter.render(&format!("Error: {e}"), Role::System);
                }
                self.finish(TurnOutcome::Failed);
            }
        }
    }

    /// `Rendering → AwaitingSpeech`. The reveal keeps running on its own.
    fn begin_speech(&mut self, id: u64, text: String) {
        let Some(narrator) = self.narrator.clone() else {
            self.finish(TurnOutcome::Completed);
            return;
        };
        let Some(turn) = self.live_turn(id) else {
            return;
        };
        turn.state = TurnState::AwaitingSpeech;
        let cancel = turn.cancel.clone();
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = narrator.synthesize(&text) => result,
            };
            let _ = tx.send(TurnEvent::SpeechReady { turn: id, result });
        });
    }

    fn on_speech_ready(&mut self, id: u64, result: Result<Option<String>>) {
        if self.live_turn(id).is_none() {
            debug!(turn = id, "discarding synthesized speech of a finished turn");
            return;
        }

        let url = match result {
            Ok(Some(url)) => url,
            Ok(None) => {
                self.finish(TurnOutcome::Completed);
                return;
            }
            Err(e) => {
                warn!(turn = id, error = %e, "speech synthesis failed");
                self.finish(TurnOutcome::Completed);
                return;
            }
        };

        let started = match &self.narrator {
            Some(narrator) => narrator.play(&url),
            None => {
                self.finish(TurnOutcome::Completed);
                return;
            }
        };
        match started {
            Ok(playback) => self.watch_playback(id, playback),
            Err(e) => {
                warn!(turn = id, error = %e, "playback failed to start");
                self.finish(TurnOutcome::Completed);
            }
        }
    }

    fn watch_playback(&mut self, id: u64, playback: Playback) {
        self.session.register_audio(playback.handle());
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = playback.finished().await;
            let _ = tx.send(TurnEvent::SpeechFinished { turn: id, result });
        });
    }

    /// `AwaitingSpeech → Done`.
    fn on_speech_finished(&mut self, id: u64, result: Result<()>) {
        if self.live_turn(id).is_none() {
            return;
        }
        if let Err(e) = result {
            warn!(turn = id, error = %e, "playback failed");
        }
        self.session.release_audio();
        self.finish(TurnOutcome::Completed);
    }

    /// Terminal state, then back to idle.
    fn finish(&mut self, outcome: TurnOutcome) {
        if let Some(mut turn) = self.current.take() {
            turn.state = match outcome {
                TurnOutcome::Aborted => TurnState::Cancelled,
                TurnOutcome::Completed | TurnOutcome::Failed => TurnState::Done,
            };
            turn.outcome = Some(outcome);
            info!(turn = turn.id, source = %turn.source, outcome = ?outcome, "turn finished");
            let _ = self.turns_tx.send(TurnSummary {
                id: turn.id,
                source: turn.source,
                outcome,
                reply: turn.reply,
            });
        }
        self.session.end();
        self.publish_busy();
    }

    /// Stop path: cancel the request, silence speech, freeze reveals.
    fn stop(&mut self, notify_backend: bool) {
        let halted = self.session.halt();
        if halted.audio_stopped {
            self.presenter.render(TTS_STOPPED_MESSAGE, Role::System);
        }
        debug!(?halted, "stop");

        if self.current.is_some() {
            self.finish(TurnOutcome::Aborted);
        } else {
            self.session.end();
            self.publish_busy();
        }

        if notify_backend {
            self.gateway.spawn_control(ControlOp::Stop);
        }
    }

    fn publish_busy(&self) {
        self.busy_tx.send_replace(self.session.is_busy());
    }
}

/// Cloneable front door of a spawned controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    ingress: mpsc::Sender<Ingress>,
    busy: watch::Receiver<bool>,
    turns: broadcast::Sender<TurnSummary>,
}

impl ControllerHandle {
    /// Deliver `msg`. Returns `false` once the controller has stopped.
    pub async fn send(&self, msg: Ingress) -> bool {
        self.ingress.send(msg).await.is_ok()
    }

    pub async fn submit(&self, text: impl Into<String>) -> bool {
        self.send(Ingress::Submit(text.into())).await
    }

    pub async fn keystroke(&self) -> bool {
        self.send(Ingress::Keystroke).await
    }

    pub async fn stop(&self) -> bool {
        self.send(Ingress::Stop).await
    }

    pub async fn shutdown(&self) -> bool {
        self.send(Ingress::Shutdown).await
    }

    /// Sender for other producers, e.g. the chat stream pump.
    pub fn ingress(&self) -> mpsc::Sender<Ingress> {
        self.ingress.clone()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Resolves when no Turn is pending (immediately if none is).
    pub async fn wait_until_idle(&self) {
        let mut rx = self.busy.clone();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    pub async fn wait_until_busy(&self) {
        let mut rx = self.busy.clone();
        let _ = rx.wait_for(|busy| *busy).await;
    }

    /// Summaries of Turns finishing after this call.
    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnSummary> {
        self.turns.subscribe()
    }
}
