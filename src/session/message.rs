//! Conversation data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Mode;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Parse a stored role name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// A function invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, unique within the session
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One conversational turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages, the call this result answers
    pub tool_call_id: Option<String>,
    /// No further content will be appended
    pub complete: bool,
    /// Generation was cut short; content is partial
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: new_id(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            complete: true,
            truncated: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// An assistant message still receiving deltas
    #[must_use]
    pub fn streaming_assistant() -> Self {
        Self {
            complete: false,
            ..Self::new(Role::Assistant, String::new())
        }
    }

    /// Result of executing `call_id`
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content.into())
        }
    }

    /// Append streamed text; ignored once complete
    pub fn push_text(&mut self, text: &str) {
        if !self.complete {
            self.content.push_str(text);
        }
    }

    /// Seal the message
    pub const fn finish(&mut self, truncated: bool) {
        self.complete = true;
        self.truncated = truncated;
    }
}

/// Incremental output from one generation
#[derive(Debug, Clone, PartialEq)]
pub enum MessageDelta {
    Text(String),
    ToolCall(ToolCall),
    /// Assistant speech (realtime-advanced only)
    Audio(Vec<f32>),
    /// The assistant message is sealed
    Finished { truncated: bool },
}

/// One logical conversation
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            id: new_id(),
            messages: Vec::new(),
            mode,
            created_at: Utc::now(),
        }
    }

    /// The most recent `window` messages, oldest first
    ///
    /// A window that starts inside a run of tool results is widened back to
    /// the assistant message that made the calls. Results with no call left
    /// in the history (a trimmed replay) are dropped, since providers reject
    /// orphaned results.
    #[must_use]
    pub fn context(&self, window: usize) -> &[Message] {
        let is_result = |i: usize| self.messages.get(i).is_some_and(|m| m.role == Role::Tool);

        let mut start = self.messages.len().saturating_sub(window);
        while start > 0 && is_result(start) {
            start -= 1;
        }
        while is_result(start) {
            start += 1;
        }
        &self.messages[start..]
    }

    /// Tool calls that do not yet have a result appended
    #[must_use]
    pub fn open_tool_calls(&self) -> Vec<&ToolCall> {
        let answered: std::collections::HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// 32-char hex id
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "save_note".to_string(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn test_context_window_oldest_first() {
        let mut session = Session::new(Mode::Stream);
        for i in 0..5 {
            session.messages.push(Message::user(format!("m{i}")));
        }

        let ctx = session.context(3);
        let texts: Vec<&str> = ctx.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_context_keeps_results_with_their_call() {
        let mut session = Session::new(Mode::Stream);
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(call("c1"));
        session.messages.push(assistant);
        session.messages.push(Message::tool_result("c1", "ok"));
        session.messages.push(Message::assistant("done"));

        let ctx = session.context(2);
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx[0].tool_calls[0].id, "c1");
        assert_eq!(ctx[2].content, "done");
    }

    #[test]
    fn test_context_window_of_parallel_results() {
        let mut session = Session::new(Mode::Stream);
        session.messages.push(Message::user("save three notes"));
        let mut assistant = Message::assistant("");
        for id in ["c1", "c2", "c3"] {
            assistant.tool_calls.push(call(id));
        }
        session.messages.push(assistant);
        for id in ["c1", "c2", "c3"] {
            session.messages.push(Message::tool_result(id, "ok"));
        }

        for window in [1, 3] {
            let ctx = session.context(window);
            assert_eq!(ctx.len(), 4);
            assert_eq!(ctx[0].role, Role::Assistant);
            assert_eq!(ctx[0].tool_calls.len(), 3);
        }
    }

    #[test]
    fn test_context_drops_results_without_a_call() {
        let mut session = Session::new(Mode::Stream);
        session.messages.push(Message::tool_result("gone", "ok"));
        session.messages.push(Message::user("hi"));

        let ctx = session.context(10);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].content, "hi");
        assert!(session.context(0).is_empty());
    }

    #[test]
    fn test_open_tool_calls() {
        let mut session = Session::new(Mode::Stream);
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(call("c1"));
        assistant.tool_calls.push(call("c2"));
        session.messages.push(assistant);
        session.messages.push(Message::tool_result("c1", "ok"));

        let open = session.open_tool_calls();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "c2");
    }

    #[test]
    fn test_complete_message_is_immutable() {
        let mut msg = Message::streaming_assistant();
        msg.push_text("hel");
        msg.finish(false);
        msg.push_text("lo");
        assert_eq!(msg.content, "hel");
    }

    #[test]
    fn test_ids_are_simple_uuids() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
