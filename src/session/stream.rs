//! Request/response mode over chat completions with server-sent events

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::Mode;
use super::message::{Message, Role, ToolCall, new_id};
use super::transport::{EventStream, GenerationRequest, ModelTransport, TransportEvent};
use crate::tools::ToolDefinition;
use crate::{Error, Result};

/// Chat completions client streaming one turn at a time
pub struct StreamTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    temperature: f32,
    instructions: String,
}

impl StreamTransport {
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        temperature: f32,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            temperature,
            instructions: instructions.into(),
        }
    }

    fn request_body(&self, context: &[Message], tools: &[ToolDefinition]) -> Value {
        let mut messages = Vec::with_capacity(context.len() + 1);
        if !self.instructions.is_empty() {
            messages.push(json!({"role": "system", "content": self.instructions}));
        }
        messages.extend(context.iter().map(chat_message));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(ToolDefinition::chat_tool_json).collect();
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

/// Render a message in chat completions shape
fn chat_message(message: &Message) -> Value {
    match message.role {
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content,
        }),
        Role::Assistant if message.tool_calls.is_empty() => {
            json!({"role": "assistant", "content": message.content})
        }
        Role::Assistant => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments.to_string()},
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental parser for chat completion chunks
///
/// Tool call fragments are accumulated by index and released together once
/// the model signals the end of the turn.
#[derive(Default)]
pub struct ChunkParser {
    calls: BTreeMap<u64, PartialCall>,
    done: bool,
}

impl ChunkParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the turn has ended
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one SSE `data` payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Stream` for provider errors or malformed chunks
    pub fn feed(&mut self, data: &str) -> Result<Vec<TransportEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        if data.trim() == "[DONE]" {
            return Ok(self.finish());
        }

        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| Error::Stream(format!("malformed chunk: {e}")))?;

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .unwrap_or("an error occurred during streaming");
            return Err(Error::Stream(message.to_string()));
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            // Keepalive or usage-only chunk
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        let delta = &choice["delta"];

        if let Some(text) = delta.get("content").and_then(Value::as_str)
            && !text.is_empty()
        {
            events.push(TransportEvent::TextDelta(text.to_string()));
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in calls {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                let function = &fragment["function"];
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    entry.name.push_str(name);
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    entry.arguments.push_str(args);
                }
            }
        }

        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            events.extend(self.finish());
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<TransportEvent> {
        self.done = true;
        let mut events: Vec<TransportEvent> = std::mem::take(&mut self.calls)
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let arguments = if c.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or(Value::String(c.arguments))
                };
                let id = if c.id.is_empty() {
                    format!("call_{}", new_id())
                } else {
                    c.id
                };
                TransportEvent::ToolCall(ToolCall {
                    id,
                    name: c.name,
                    arguments,
                })
            })
            .collect();
        events.push(TransportEvent::Done);
        events
    }
}

#[async_trait]
impl ModelTransport for StreamTransport {
    fn mode(&self) -> Mode {
        Mode::Stream
    }

    async fn generate(&mut self, request: GenerationRequest<'_>) -> Result<EventStream> {
        let body = self.request_body(request.context, request.tools);
        tracing::debug!(
            model = %self.model,
            messages = request.context.len(),
            tools = request.tools.len(),
            "starting chat completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stream(format!("chat completions error {status}: {body}")));
        }

        let sse = response.bytes_stream().eventsource().boxed();
        let state = (sse, ChunkParser::new(), VecDeque::new());

        let stream = futures::stream::unfold(state, |(mut sse, mut parser, mut pending)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (sse, parser, pending)));
                }
                if parser.is_done() {
                    return None;
                }

                match sse.next().await {
                    Some(Ok(event)) => {
                        tracing::trace!(data = %event.data, "chat completion chunk");
                        match parser.feed(&event.data) {
                            Ok(events) => pending.extend(events),
                            Err(e) => {
                                parser.done = true;
                                return Some((Err(e), (sse, parser, pending)));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        parser.done = true;
                        let err = Error::Stream(format!("SSE stream error: {e}"));
                        return Some((Err(err), (sse, parser, pending)));
                    }
                    None => {
                        parser.done = true;
                        let err = Error::Stream("stream closed before response completed".to_string());
                        return Some((Err(err), (sse, parser, pending)));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn interrupt(&mut self) -> Result<()> {
        // Dropping the event stream aborts the HTTP request
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_deltas_then_done() {
        let mut parser = ChunkParser::new();
        let events = parser
            .feed(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(events, vec![TransportEvent::TextDelta("Hel".into())]);

        let events = parser.feed("[DONE]").unwrap();
        assert_eq!(events, vec![TransportEvent::Done]);
        assert!(parser.is_done());
    }

    #[test]
    fn test_tool_call_fragments_accumulate_by_index() {
        let mut parser = ChunkParser::new();
        parser
            .feed(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"save_note","arguments":"{\"te"}}]}}]}"#)
            .unwrap();
        parser
            .feed(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"xt\":\"buy oat milk\"}"}}]}}]}"#)
            .unwrap();
        let events = parser
            .feed(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#)
            .unwrap();

        assert_eq!(
            events,
            vec![
                TransportEvent::ToolCall(ToolCall {
                    id: "call_1".into(),
                    name: "save_note".into(),
                    arguments: json!({"text": "buy oat milk"}),
                }),
                TransportEvent::Done,
            ]
        );
    }

    #[test]
    fn test_error_chunk_is_stream_error() {
        let mut parser = ChunkParser::new();
        let err = parser
            .feed(r#"{"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Stream(m) if m == "overloaded"));
    }

    #[test]
    fn test_assistant_tool_calls_rendered() {
        let mut msg = Message::assistant("");
        msg.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "save_note".into(),
            arguments: json!({"text": "hi"}),
        });
        let rendered = chat_message(&msg);
        assert!(rendered["content"].is_null());
        assert_eq!(rendered["tool_calls"][0]["function"]["arguments"], r#"{"text":"hi"}"#);
    }
}
