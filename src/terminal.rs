//! Terminal rendering of presenter events.

use std::io::{self, Write};

use colored::*;
use tokio::sync::mpsc;
use tracing::warn;

use crate::presenter::{PresenterEvent, Role};

/// Writes chat log changes as colored lines.
///
/// A bot reply is printed character by character on one line; if another
/// entry arrives mid-reveal the line is broken and the reply resumes on a
/// fresh, re-labelled line.
pub struct TerminalRenderer<W: Write> {
    out: W,
    bot_name: String,
    /// Bot reply currently being revealed, and whether its line was broken.
    open_reveal: Option<(u64, bool)>,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, bot_name: impl Into<String>) -> Self {
        Self {
            out,
            bot_name: bot_name.into(),
            open_reveal: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn bot_label(&self) -> ColoredString {
        format!("{}:", self.bot_name).bright_cyan().bold()
    }

    /// End the partial reveal line before printing a whole line.
    fn break_reveal_line(&mut self) -> io::Result<()> {
        if let Some((id, false)) = self.open_reveal {
            writeln!(self.out)?;
            self.open_reveal = Some((id, true));
        }
        Ok(())
    }

    pub fn handle(&mut self, event: &PresenterEvent) -> io::Result<()> {
        match event {
            PresenterEvent::Appended { id, role, text, author, animated } => match role {
                Role::Bot if *animated => {
                    self.break_reveal_line()?;
                    let label = self.bot_label();
                    write!(self.out, "{label} ")?;
                    self.open_reveal = Some((*id, false));
                }
                Role::Bot => {
                    self.break_reveal_line()?;
                    let label = self.bot_label();
                    writeln!(self.out, "{label} {text}")?;
                }
                Role::User => {
                    self.break_reveal_line()?;
                    match author {
                        Some(user) => writeln!(
                            self.out,
                            "{} {}",
                            format!("[twitch] {user}:").bright_magenta(),
                            text
                        )?,
                        None => writeln!(self.out, "{} {}", "You:".bright_green().bold(), text)?,
                    }
                }
                Role::System => {
                    self.break_reveal_line()?;
                    writeln!(self.out, "{} {}", "System:".bright_yellow().bold(), text)?;
                }
            },
            PresenterEvent::Revealed { id, ch } => {
                match self.open_reveal {
                    Some((open, true)) if open == *id => {
                        let label = self.bot_label();
                        write!(self.out, "{label} ")?;
                        self.open_reveal = Some((open, false));
                    }
                    Some((open, false)) if open == *id => {}
                    _ => {
                        self.break_reveal_line()?;
                        let label = self.bot_label();
                        write!(self.out, "{label} ")?;
                        self.open_reveal = Some((*id, false));
                    }
                }
                write!(self.out, "{ch}")?;
            }
            PresenterEvent::RevealFinished { id } => self.close_reveal(*id, false)?,
            PresenterEvent::RevealHalted { id } => self.close_reveal(*id, true)?,
            PresenterEvent::Fading { .. } | PresenterEvent::Removed { .. } => {
                // Printed lines cannot be withdrawn.
            }
        }
        self.out.flush()
    }

    fn close_reveal(&mut self, id: u64, halted: bool) -> io::Result<()> {
        match self.open_reveal {
            Some((open, broken)) if open == id => {
                if halted && !broken {
                    write!(self.out, " {}", "[stopped]".dimmed())?;
                }
                if !broken {
                    writeln!(self.out)?;
                }
                self.open_reveal = None;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Drain presenter events to stdout until the channel closes.
pub async fn run_terminal(mut events: mpsc::UnboundedReceiver<PresenterEvent>, bot_name: String) {
    let mut renderer = TerminalRenderer::new(io::stdout(), bot_name);
    while let Some(event) = events.recv().await {
        if let Err(e) = renderer.handle(&event) {
            warn!(error = %e, "terminal write failed, rendering stopped");
            break;
        }
    }
}
