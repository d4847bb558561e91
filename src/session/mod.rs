//! Language model session management
//!
//! The [`SessionManager`] owns the active [`Session`] and is the only
//! component that mutates it. Each interaction mode is a [`ModelTransport`]
//! implementation sharing one delta-stream contract.

mod message;
mod realtime;
mod stream;
mod transport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use message::{Message, MessageDelta, Role, Session, ToolCall, new_id};
pub use realtime::{
    RealtimeAdvancedTransport, RealtimeBasicTransport, RealtimeSettings, decode_pcm16,
    encode_pcm16,
};
pub use stream::{ChunkParser, StreamTransport};
pub use transport::{EventStream, GenerationRequest, ModelTransport, TransportEvent};

use crate::db::HistoryStore;
use crate::tools::ToolDefinition;
use crate::{Error, Result};

/// Interaction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Request/response turns over server-sent events
    Stream,
    /// Persistent text session
    RealtimeBasic,
    /// Persistent audio session with barge-in
    RealtimeAdvanced,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::RealtimeBasic => "realtime-basic",
            Self::RealtimeAdvanced => "realtime-advanced",
        }
    }

    /// Whether user audio is sent to the model directly
    #[must_use]
    pub const fn accepts_audio(self) -> bool {
        matches!(self, Self::RealtimeAdvanced)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "stream" => Ok(Self::Stream),
            "realtime-basic" | "realtime" => Ok(Self::RealtimeBasic),
            "realtime-advanced" => Ok(Self::RealtimeAdvanced),
            other => Err(Error::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// How a generation ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Final assistant message for this turn
    Completed {
        message_id: String,
        text: String,
        /// Assistant speech produced by the model (realtime-advanced)
        audio: Vec<f32>,
    },
    /// The model is waiting on tool results
    ToolCalls {
        message_id: String,
        text: String,
        calls: Vec<ToolCall>,
    },
}

/// Owns the session and drives generations through a transport
pub struct SessionManager {
    session: Session,
    transport: Box<dyn ModelTransport>,
    context_window: usize,
    tools: Vec<ToolDefinition>,
    history: Option<Arc<dyn HistoryStore>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        transport: Box<dyn ModelTransport>,
        context_window: usize,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            session: Session::new(transport.mode()),
            transport,
            context_window: context_window.max(1),
            tools,
            history: None,
        }
    }

    /// Persist every completed message to `store`
    #[must_use]
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.session.mode
    }

    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Seed context from a replayed history, continuing chat `chat_id`
    pub fn seed(&mut self, chat_id: impl Into<String>, messages: Vec<Message>) {
        let mut session = Session::new(self.session.mode);
        session.id = chat_id.into();
        let skip = messages.len().saturating_sub(self.context_window);
        session.messages = messages.into_iter().skip(skip).collect();
        tracing::info!(
            chat_id = %session.id,
            messages = session.messages.len(),
            "session seeded from history"
        );
        self.session = session;
    }

    /// Start a fresh conversation
    pub fn reset(&mut self) {
        self.session = Session::new(self.session.mode);
        tracing::info!(session_id = %self.session.id, "new session");
    }

    /// Replace the transport between turns
    ///
    /// # Errors
    ///
    /// Returns error if tool calls are still awaiting results
    pub async fn switch_mode(&mut self, transport: Box<dyn ModelTransport>) -> Result<()> {
        let open = self.session.open_tool_calls().len();
        if open > 0 {
            return Err(Error::Tool(format!(
                "cannot switch modes with {open} open tool call(s)"
            )));
        }

        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "error closing previous transport");
        }
        let from = self.session.mode;
        self.transport = transport;
        self.session.mode = self.transport.mode();
        tracing::info!(from = %from, to = %self.session.mode, "mode switched");
        Ok(())
    }

    /// Add a user message and generate a reply
    ///
    /// # Errors
    ///
    /// Returns `Error::Stream` when the connection drops mid-generation (the
    /// partial reply is kept) or `Error::Cancelled` when `cancel` fires
    pub async fn send(
        &mut self,
        user_text: &str,
        audio: Option<&[f32]>,
        deltas: &mpsc::UnboundedSender<MessageDelta>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.close_open_tool_calls();

        let message = Message::user(user_text);
        self.persist(&message);
        self.session.messages.push(message);

        let audio = audio.filter(|_| self.session.mode.accepts_audio());
        self.generate(audio, deltas, cancel).await
    }

    /// Append the result for an open tool call
    ///
    /// # Errors
    ///
    /// Returns error if `call_id` is not an open call
    pub fn append_tool_result(&mut self, call_id: &str, content: &str) -> Result<()> {
        let is_open = self
            .session
            .open_tool_calls()
            .iter()
            .any(|c| c.id == call_id);
        if !is_open {
            return Err(Error::Tool(format!("no open tool call with id {call_id}")));
        }

        let message = Message::tool_result(call_id, content);
        self.persist(&message);
        self.session.messages.push(message);
        Ok(())
    }

    /// Continue generation after every tool call has its result
    ///
    /// # Errors
    ///
    /// Returns error if results are missing, or as [`Self::send`]
    pub async fn resume(
        &mut self,
        deltas: &mpsc::UnboundedSender<MessageDelta>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let open = self.session.open_tool_calls().len();
        if open > 0 {
            return Err(Error::Tool(format!(
                "{open} tool call(s) still awaiting results"
            )));
        }
        self.generate(None, deltas, cancel).await
    }

    /// Answer every open tool call with a cancelled result
    pub fn close_open_tool_calls(&mut self) -> usize {
        let open: Vec<String> = self
            .session
            .open_tool_calls()
            .iter()
            .map(|c| c.id.clone())
            .collect();

        for call_id in &open {
            let payload = json!({
                "status": "error",
                "error": {"kind": "cancelled", "message": "the user cancelled this call"},
            });
            let message = Message::tool_result(call_id.as_str(), payload.to_string());
            self.persist(&message);
            self.session.messages.push(message);
        }
        if !open.is_empty() {
            tracing::debug!(count = open.len(), "closed open tool calls");
        }
        open.len()
    }

    /// Abort the in-progress generation (barge-in)
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot deliver the cancel
    pub async fn interrupt(&mut self) -> Result<()> {
        self.transport.interrupt().await
    }

    /// Release the transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to close cleanly
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    async fn generate(
        &mut self,
        audio: Option<&[f32]>,
        deltas: &mpsc::UnboundedSender<MessageDelta>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let response_id = new_id();
        let request = GenerationRequest {
            context: self.session.context(self.context_window),
            tools: &self.tools,
            response_id: &response_id,
            audio,
        };

        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.transport.generate(request) => result,
        };
        let mut events = match started {
            Ok(events) => events,
            Err(Error::Cancelled) => {
                self.interrupt_quietly().await;
                return Err(Error::Cancelled);
            }
            Err(e) => return Err(into_stream_error(e)),
        };

        let mut message = Message::streaming_assistant();
        message.id = response_id;
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut audio_out: Vec<f32> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = events.next() => Some(next),
            };
            let Some(next) = next else {
                drop(events);
                self.interrupt_quietly().await;
                tracing::debug!("generation cancelled, partial reply discarded");
                return Err(Error::Cancelled);
            };

            match next {
                Some(Ok(TransportEvent::TextDelta(text))) => {
                    if calls.is_empty() {
                        message.push_text(&text);
                        let _ = deltas.send(MessageDelta::Text(text));
                    } else {
                        tracing::trace!("dropping text after tool call");
                    }
                }
                Some(Ok(TransportEvent::AudioDelta(samples))) => {
                    audio_out.extend_from_slice(&samples);
                    let _ = deltas.send(MessageDelta::Audio(samples));
                }
                Some(Ok(TransportEvent::ToolCall(call))) => {
                    tracing::info!(tool = %call.name, call_id = %call.id, "model requested tool");
                    let _ = deltas.send(MessageDelta::ToolCall(call.clone()));
                    calls.push(call);
                }
                Some(Ok(TransportEvent::UserTranscript(text))) => {
                    tracing::debug!(transcript = %text, "server transcript of user audio");
                }
                Some(Ok(TransportEvent::Done)) | None => break,
                Some(Err(e)) => {
                    let err = into_stream_error(e);
                    tracing::warn!(error = %err, kept_chars = message.content.len(), "stream failed mid-generation");
                    message.finish(true);
                    if !message.content.is_empty() {
                        self.persist(&message);
                        self.session.messages.push(message);
                    }
                    let _ = deltas.send(MessageDelta::Finished { truncated: true });
                    return Err(err);
                }
            }
        }
        drop(events);

        message.tool_calls.clone_from(&calls);
        message.finish(false);
        self.persist(&message);
        let message_id = message.id.clone();
        let text = message.content.clone();
        self.session.messages.push(message);
        let _ = deltas.send(MessageDelta::Finished { truncated: false });

        if calls.is_empty() {
            Ok(TurnOutcome::Completed {
                message_id,
                text,
                audio: audio_out,
            })
        } else {
            Ok(TurnOutcome::ToolCalls {
                message_id,
                text,
                calls,
            })
        }
    }

    async fn interrupt_quietly(&mut self) {
        if let Err(e) = self.transport.interrupt().await {
            tracing::debug!(error = %e, "transport interrupt failed");
        }
    }

    fn persist(&self, message: &Message) {
        let Some(store) = &self.history else {
            return;
        };
        if message.content.is_empty() {
            return;
        }
        if let Err(e) = store.append(&self.session.id, message.role, &message.content, message.created_at) {
            tracing::warn!(error = %e, role = message.role.as_str(), "failed to persist message");
        }
    }
}

fn into_stream_error(e: Error) -> Error {
    match e {
        Error::Stream(_) | Error::Cancelled => e,
        other => Error::Stream(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("stream".parse::<Mode>().unwrap(), Mode::Stream);
        assert_eq!("realtime_advanced".parse::<Mode>().unwrap(), Mode::RealtimeAdvanced);
        assert_eq!(Mode::RealtimeBasic.to_string(), "realtime-basic");
        assert!("turbo".parse::<Mode>().is_err());
    }

    #[test]
    fn test_only_advanced_accepts_audio() {
        assert!(Mode::RealtimeAdvanced.accepts_audio());
        assert!(!Mode::Stream.accepts_audio());
    }
}
