//! Model transport contract shared by all three interaction modes

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::Mode;
use super::message::{Message, ToolCall};
use crate::Result;
use crate::tools::ToolDefinition;

/// One event from the model, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    TextDelta(String),
    /// Assistant speech as 24 kHz mono samples
    AudioDelta(Vec<f32>),
    ToolCall(ToolCall),
    /// Server-side transcript of user audio
    UserTranscript(String),
    /// Generation finished
    Done,
}

/// Ordered model events for one generation
pub type EventStream = BoxStream<'static, Result<TransportEvent>>;

/// What to send for one generation
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Bounded context, oldest first
    pub context: &'a [Message],
    pub tools: &'a [ToolDefinition],
    /// Id the assistant message for this generation will carry
    pub response_id: &'a str,
    /// Raw user audio for the trailing user message (realtime-advanced)
    pub audio: Option<&'a [f32]>,
}

/// A connection to the language model
#[async_trait]
pub trait ModelTransport: Send {
    fn mode(&self) -> Mode;

    /// Start a generation over `request.context`
    async fn generate(&mut self, request: GenerationRequest<'_>) -> Result<EventStream>;

    /// Abort any in-progress generation
    async fn interrupt(&mut self) -> Result<()>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;
}
