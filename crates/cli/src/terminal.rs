use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use dchat_tool_runtime::{SessionStatus, TurnEvent};
use std::io::{self, Write};
use tracing::debug;

use crate::renderer::CallView;
use crate::session::SessionSummary;

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const USER_PROMPT: Color = Color::Green;
    const ASSISTANT_TEXT: Color = Color::Cyan;
    const REASONING: Color = Color::DarkCyan;
    const TOOL_CALL: Color = Color::Yellow;
    const TOOL_RESULT: Color = Color::DarkGreen;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
    const HEADER: Color = Color::Magenta;
}

/// Manages terminal I/O for the interactive REPL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminal;

impl Terminal {
    pub fn new() -> Self {
        Self
    }

    fn colored(&self, color: Color, text: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(stdout, SetForegroundColor(color), Print(text), ResetColor)?;
        stdout.flush()?;
        Ok(())
    }

    /// Print the startup banner.
    pub fn print_banner(&self, model: &str, tools: &[String]) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("dchat"),
            ResetColor,
            Print(" - chat with tools\n"),
            SetForegroundColor(Colors::DIM),
            Print(format!("Model: {} | Tools: {}\n", model, tools.join(", "))),
            Print("Type 'exit' or 'quit' to end. Ctrl+C abandons the current turn.\n"),
            Print("---\n"),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Read a line of user input with prompt.
    /// Returns None if the user wants to exit.
    pub fn read_input(&self) -> Result<Option<String>> {
        self.colored(Colors::USER_PROMPT, "\nyou> ")?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            return Ok(None);
        }
        let trimmed = input.trim().to_string();

        if trimmed == "exit" || trimmed == "quit" || trimmed == "/exit" || trimmed == "/quit" {
            return Ok(None);
        }

        Ok(Some(trimmed))
    }

    /// Display a turn event.
    pub fn display_event(&self, event: &TurnEvent) -> Result<()> {
        match event {
            TurnEvent::Status { status, step } => {
                debug!(%status, step, "Turn status");
                if *status == SessionStatus::AwaitingApproval {
                    self.colored(Colors::DIM, "\n(waiting for approval)\n")?;
                }
            }
            TurnEvent::TextDelta { text } => self.colored(Colors::ASSISTANT_TEXT, text)?,
            TurnEvent::ReasoningDelta { text } => self.colored(Colors::REASONING, text)?,
            TurnEvent::ToolCallUpdate { call } => self.display_call(&CallView::from(call))?,
            TurnEvent::Done { reason, steps, .. } => {
                debug!(?reason, steps, "Turn finished");
                self.colored(Colors::DIM, "\n")?;
            }
            TurnEvent::Error { message } => {
                self.colored(Colors::ERROR, &format!("\n[error: {}]\n", message))?
            }
        }
        Ok(())
    }

    fn display_call(&self, view: &CallView) -> Result<()> {
        let color = match view {
            CallView::Progress { .. } | CallView::AwaitingDecision { .. } => Colors::TOOL_CALL,
            CallView::Result {
                is_error: false, ..
            } => Colors::TOOL_RESULT,
            CallView::Result { .. } | CallView::Denied { .. } => Colors::ERROR,
        };
        self.colored(color, &format!("\n  {}\n", view.summary()))
    }

    /// Ask for a decision on a call; anything but y/yes rejects.
    pub fn prompt_approval(&self, view: &CallView) -> Result<bool> {
        self.colored(Colors::USER_PROMPT, "Allow? [y/N] ")?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        debug!(summary = %view.summary(), answer = %input.trim(), "Approval answered");
        Ok(is_yes(&input))
    }

    /// Print a session listing.
    pub fn print_sessions(&self, sessions: &[SessionSummary]) -> Result<()> {
        let mut stdout = io::stdout();
        if sessions.is_empty() {
            return self.colored(Colors::DIM, "No saved sessions found.\n");
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("Saved Sessions:\n"),
            SetForegroundColor(Colors::DIM),
            Print(format!(
                "{:<20} {:<40} {:<28} {:<6}\n",
                "ID", "NAME", "MODEL", "MSGS"
            )),
            Print(format!("{}\n", "-".repeat(96))),
            ResetColor,
        )?;

        for s in sessions {
            let name = if s.name.chars().count() > 38 {
                format!("{}...", s.name.chars().take(35).collect::<String>())
            } else {
                s.name.clone()
            };
            execute!(
                stdout,
                Print(format!(
                    "{:<20} {:<40} {:<28} {:<6}\n",
                    s.id, name, s.model, s.message_count,
                )),
            )?;
        }

        stdout.flush()?;
        Ok(())
    }

    pub fn print_error(&self, msg: &str) -> Result<()> {
        self.colored(Colors::ERROR, &format!("Error: {}\n", msg))
    }

    pub fn print_info(&self, msg: &str) -> Result<()> {
        self.colored(Colors::DIM, &format!("{}\n", msg))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
