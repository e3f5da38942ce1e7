use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use renai_chat::cli::Args;
use renai_chat::config::ClientConfig;
use renai_chat::controller::{ControllerHandle, ControllerOptions, ConversationController, TurnOutcome};
use renai_chat::gateway::RequestGateway;
use renai_chat::narrator::{CommandPlayer, Narrator};
use renai_chat::presenter::{ChatLog, Presenter, PresenterTimings};
use renai_chat::stream::pump_chat_stream;
use renai_chat::terminal::run_terminal;

/// Time the renderer gets to flush after the controller is gone.
const RENDER_DRAIN: Duration = Duration::from_millis(200);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout carries the chat; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let config = args.load_config()?;
    tracing::info!(base_url = %config.base_url, "renai-chat starting");

    let gateway = RequestGateway::from_config(&config)?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let presenter = Presenter::new(ChatLog::new(), PresenterTimings::from_config(&config)).with_events(events_tx);

    let mut controller =
        ConversationController::new(gateway.clone(), presenter, ControllerOptions::from_config(&config));
    if config.speech_enabled {
        let player = Arc::new(CommandPlayer::from_config(&config.player));
        controller = controller.with_narrator(Narrator::new(gateway.clone(), player));
    }
    let (handle, controller_task) = controller.spawn();
    let renderer = tokio::spawn(run_terminal(events_rx, config.bot_name.clone()));

    if config.stream_enabled {
        tokio::spawn(pump_chat_stream(gateway, handle.ingress(), config.stream_retry()));
    }

    let outcome = match args.once.clone() {
        Some(prompt) => run_once(&handle, &config, prompt).await,
        None => run_interactive(&handle).await.map_err(Into::into),
    };

    handle.shutdown().await;
    drop(handle);
    if let Err(e) = controller_task.await {
        tracing::error!(error = %e, "controller task failed");
    }
    let _ = tokio::time::timeout(RENDER_DRAIN, renderer).await;

    tracing::info!("renai-chat shut down");
    outcome
}

/// Line-oriented input: `/stop` halts the current Turn, `/quit` or end of
/// input exits, anything else is submitted.
async fn run_interactive(handle: &ControllerHandle) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command == "/quit" {
            break;
        }
        let delivered = if command == "/stop" {
            handle.stop().await
        } else {
            handle.submit(line).await
        };
        if !delivered {
            tracing::warn!("controller stopped, input closed");
            break;
        }
    }
    Ok(())
}

/// Submit one prompt and wait for its Turn, including the end of the reveal.
async fn run_once(
    handle: &ControllerHandle,
    config: &ClientConfig,
    prompt: String,
) -> Result<(), Box<dyn std::error::Error>> {
    // Subscribe first so the summary cannot be missed.
    let mut turns = handle.subscribe_turns();
    if prompt.trim().is_empty() {
        return Err("--once needs a non-empty prompt".into());
    }
    if !handle.submit(prompt).await {
        return Err("controller stopped before the prompt was sent".into());
    }

    let summary = turns.recv().await?;
    match summary.outcome {
        TurnOutcome::Completed => {
            // Speech may finish before the typewriter does.
            let chars = summary.reply.as_deref().map_or(0, |r| r.chars().count());
            let reveal = config.typing_tick().saturating_mul(u32::try_from(chars + 1).unwrap_or(u32::MAX));
            tokio::time::sleep(reveal).await;
            Ok(())
        }
        TurnOutcome::Aborted => Err("turn was stopped".into()),
        TurnOutcome::Failed => Err("turn failed, see the chat log".into()),
    }
}
