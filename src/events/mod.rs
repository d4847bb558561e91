//! Events published to the UI and commands accepted from it
//!
//! The daemon publishes [`UiEvent`]s on a broadcast channel so any number of
//! front ends can observe it. Publishing is best-effort: a send with no
//! subscribers is not an error.

use std::fmt;

use tokio::sync::{broadcast, mpsc};

use crate::session::Mode;
use crate::state::Status;

/// Buffered UI events per subscriber before the slowest one lags
pub const UI_EVENT_CAPACITY: usize = 256;

/// Buffered commands before senders wait
pub const COMMAND_CAPACITY: usize = 32;

/// Something the UI should show
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status(Status),
    /// User speech or typed text
    Transcript { text: String, is_final: bool },
    AssistantDelta { text: String },
    AssistantFinal { text: String, truncated: bool },
    /// The model invoked a tool
    ToolCall { name: String, invocation: String },
    ToolResult { name: String, ok: bool, summary: String },
    Error { reason: String },
    Warning { reason: String },
    ModeChanged(Mode),
}

impl fmt::Display for UiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "[{status}]"),
            Self::Transcript { text, is_final } => {
                write!(f, "you{}: {text}", if *is_final { "" } else { " (partial)" })
            }
            Self::AssistantDelta { text } => f.write_str(text),
            Self::AssistantFinal { text, truncated } => {
                write!(f, "assistant: {text}{}", if *truncated { " [cut off]" } else { "" })
            }
            Self::ToolCall { name, invocation } => write!(f, "-> {name}({invocation})"),
            Self::ToolResult { name, ok, summary } => {
                write!(f, "<- {name} {}: {summary}", if *ok { "ok" } else { "failed" })
            }
            Self::Error { reason } => write!(f, "error: {reason}"),
            Self::Warning { reason } => write!(f, "warning: {reason}"),
            Self::ModeChanged(mode) => write!(f, "mode: {mode}"),
        }
    }
}

/// Instruction from the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start listening
    Start,
    /// Finish the current utterance, or cancel anything else
    Stop,
    Cancel,
    SwitchMode(Mode),
    SubmitText(String),
    NewSession,
    Shutdown,
}

impl Command {
    /// Parse a console input line
    ///
    /// Plain text is submitted as a message; `/start`, `/stop`, `/cancel`,
    /// `/mode <mode>`, `/new` and `/quit` are commands.
    ///
    /// # Errors
    ///
    /// Returns a message for unknown commands or modes
    pub fn from_console_line(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::SubmitText(line.to_string())));
        };

        let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let command = match name {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "cancel" => Self::Cancel,
            "new" => Self::NewSession,
            "quit" | "exit" => Self::Shutdown,
            "mode" => Self::SwitchMode(arg.parse().map_err(|e: crate::Error| e.to_string())?),
            other => return Err(format!("unknown command: /{other}")),
        };
        Ok(Some(command))
    }
}

/// Channel for UI events
#[must_use]
pub fn ui_channel() -> (broadcast::Sender<UiEvent>, broadcast::Receiver<UiEvent>) {
    broadcast::channel(UI_EVENT_CAPACITY)
}

/// Channel for commands
#[must_use]
pub fn command_channel() -> (mpsc::Sender<Command>, mpsc::Receiver<Command>) {
    mpsc::channel(COMMAND_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_lines() {
        assert_eq!(
            Command::from_console_line("what time is it").unwrap(),
            Some(Command::SubmitText("what time is it".into()))
        );
        assert_eq!(Command::from_console_line("/quit").unwrap(), Some(Command::Shutdown));
        assert_eq!(
            Command::from_console_line("/mode realtime-advanced").unwrap(),
            Some(Command::SwitchMode(Mode::RealtimeAdvanced))
        );
        assert_eq!(Command::from_console_line("   ").unwrap(), None);
        assert!(Command::from_console_line("/mode warp").is_err());
        assert!(Command::from_console_line("/dance").is_err());
    }

    #[test]
    fn test_display() {
        let event = UiEvent::ToolResult {
            name: "save_note".into(),
            ok: true,
            summary: "Note pasted!".into(),
        };
        assert_eq!(event.to_string(), "<- save_note ok: Note pasted!");
        assert_eq!(UiEvent::Status(Status::Listening).to_string(), "[listening]");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let (tx, mut a) = ui_channel();
        let mut b = tx.subscribe();
        tx.send(UiEvent::Status(Status::Idle)).unwrap();
        assert_eq!(a.recv().await.unwrap(), UiEvent::Status(Status::Idle));
        assert_eq!(b.recv().await.unwrap(), UiEvent::Status(Status::Idle));
    }
}
