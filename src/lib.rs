//! Terminal client for the RenAI chat backend.
//!
//! The client turns typed messages, live-stream chat and periods of silence
//! into conversation Turns. Each Turn asks the backend for a reply, reveals
//! it with a typewriter effect and speaks it through an external audio
//! player. At most one Turn is in flight; a stop cancels the request,
//! silences speech and freezes any reveal.
//!
//! The pieces, bottom-up:
//!
//! - [`gateway`]: HTTP calls to the backend endpoints.
//! - [`stream`]: the `/twitch_chat_stream` SSE subscription.
//! - [`presenter`]: the chat log and its animations.
//! - [`narrator`] and [`sanitize`]: speech synthesis and playback.
//! - [`session`] and [`idle`]: busy flag, cancellation and idle bookkeeping.
//! - [`controller`]: the task that ties them together.

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod idle;
pub mod narrator;
pub mod presenter;
pub mod sanitize;
pub mod session;
pub mod stream;
pub mod terminal;
pub mod wire;

pub use config::ClientConfig;
pub use controller::{ControllerHandle, ConversationController, Ingress, TurnOutcome, TurnSource, TurnSummary};
pub use error::{ChatError, Result};
pub use gateway::RequestGateway;
pub use narrator::{AudioHandle, AudioPlayer, CommandPlayer, Narrator, Playback};
pub use presenter::{ChatLog, ChatMessage, Presenter, PresenterEvent, Role};
