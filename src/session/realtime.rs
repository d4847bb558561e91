//! Persistent WebSocket session for the realtime modes
//!
//! The server keeps its own copy of the conversation. Each generation
//! reconciles it with the bounded context: items that fell out of the window
//! are deleted and missing ones are created, so the server never sees more
//! than the session manager sent. Server-created items (assistant output,
//! committed audio) are mapped back to the message ids they belong to.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::Mode;
use super::message::{Message, Role};
use super::transport::{EventStream, GenerationRequest, ModelTransport, TransportEvent};
use crate::tools::ToolDefinition;
use crate::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Samples per `input_audio_buffer.append` message (1 s)
const AUDIO_CHUNK_SAMPLES: usize = 24_000;

/// Server error codes that do not affect the current response
const BENIGN_ERROR_CODES: &[&str] = &[
    "response_cancel_not_active",
    "item_not_found",
    "input_audio_buffer_commit_empty",
];

/// Connection settings shared by both realtime variants
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub url: String,
    pub model: String,
    pub api_key: SecretString,
    pub instructions: String,
    pub temperature: f32,
}

/// Which server item ids belong to which session message
#[derive(Debug, Default)]
struct ItemMap {
    by_message: HashMap<String, Vec<String>>,
    /// Message id whose user audio is awaiting its committed item id
    pending_audio: Option<String>,
}

impl ItemMap {
    fn record(&mut self, message_id: &str, item_id: &str) {
        let items = self.by_message.entry(message_id.to_string()).or_default();
        if !items.iter().any(|i| i == item_id) {
            items.push(item_id.to_string());
        }
    }
}

/// One live WebSocket plus its reader task
struct Live {
    sink: WsSink,
    events: Arc<Mutex<mpsc::UnboundedReceiver<Result<Value>>>>,
    reader: JoinHandle<()>,
}

/// Shared plumbing for the realtime transports
struct RealtimeConnection {
    settings: RealtimeSettings,
    session_config: Value,
    live: Option<Live>,
    items: Arc<StdMutex<ItemMap>>,
}

impl RealtimeConnection {
    fn new(settings: RealtimeSettings, session_config: Value) -> Self {
        Self {
            settings,
            session_config,
            live: None,
            items: Arc::new(StdMutex::new(ItemMap::default())),
        }
    }

    async fn connect(&mut self, tools: &[ToolDefinition]) -> Result<()> {
        let url = format!("{}?model={}", self.settings.url, self.settings.model);
        let mut request = url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.settings.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Stream(format!("realtime connect failed: {e}")))?;
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let parsed = match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(text.as_str()) {
                        Ok(value) => Ok(value),
                        Err(e) => {
                            tracing::debug!(error = %e, "unparseable realtime event");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        tracing::debug!(?frame, "realtime socket closed by server");
                        let _ = tx.send(Err(Error::Stream("realtime connection closed".to_string())));
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Stream(format!("realtime socket error: {e}"))));
                        break;
                    }
                };
                if tx.send(parsed).is_err() {
                    break;
                }
            }
        });

        self.live = Some(Live {
            sink,
            events: Arc::new(Mutex::new(rx)),
            reader,
        });
        if let Ok(mut items) = self.items.lock() {
            *items = ItemMap::default();
        }

        let mut session = self.session_config.clone();
        session["instructions"] = json!(self.settings.instructions);
        session["temperature"] = json!(self.settings.temperature);
        session["tools"] = tools.iter().map(ToolDefinition::realtime_tool_json).collect();
        session["tool_choice"] = json!("auto");
        self.send(json!({"type": "session.update", "session": session}))
            .await?;

        tracing::info!(model = %self.settings.model, "realtime session connected");
        Ok(())
    }

    async fn send(&mut self, event: Value) -> Result<()> {
        let Some(live) = self.live.as_mut() else {
            return Err(Error::Stream("realtime connection not open".to_string()));
        };
        if let Err(e) = live.sink.send(WsMessage::Text(event.to_string().into())).await {
            tracing::warn!(error = %e, "realtime send failed, dropping connection");
            self.drop_live();
            return Err(Error::Stream(format!("realtime send failed: {e}")));
        }
        Ok(())
    }

    fn drop_live(&mut self) {
        if let Some(live) = self.live.take() {
            live.reader.abort();
        }
    }

    /// Make the server conversation match `context`
    async fn sync(&mut self, context: &[Message], audio: Option<&[f32]>) -> Result<()> {
        let wanted: HashSet<&str> = context.iter().map(|m| m.id.as_str()).collect();

        let (stale, known): (Vec<String>, HashSet<String>) = {
            let items = self
                .items
                .lock()
                .map_err(|_| Error::Stream("realtime item map poisoned".to_string()))?;
            let stale = items
                .by_message
                .iter()
                .filter(|(id, _)| !wanted.contains(id.as_str()))
                .flat_map(|(_, server_ids)| server_ids.iter().cloned())
                .collect();
            (stale, items.by_message.keys().cloned().collect())
        };

        for item_id in stale {
            self.send(json!({"type": "conversation.item.delete", "item_id": item_id}))
                .await?;
        }
        if let Ok(mut items) = self.items.lock() {
            items.by_message.retain(|id, _| wanted.contains(id.as_str()));
        }

        let audio_message = audio.and_then(|_| context.last()).filter(|m| m.role == Role::User);

        for message in context {
            if known.contains(&message.id) {
                continue;
            }
            if audio_message.is_some_and(|m| m.id == message.id) {
                continue;
            }
            for (item_id, item) in conversation_items(message) {
                self.send(json!({"type": "conversation.item.create", "item": item}))
                    .await?;
                if let Ok(mut items) = self.items.lock() {
                    items.record(&message.id, &item_id);
                }
            }
        }

        if let (Some(samples), Some(message)) = (audio, audio_message) {
            for chunk in samples.chunks(AUDIO_CHUNK_SAMPLES) {
                self.send(json!({
                    "type": "input_audio_buffer.append",
                    "audio": encode_pcm16(chunk),
                }))
                .await?;
            }
            if let Ok(mut items) = self.items.lock() {
                items.pending_audio = Some(message.id.clone());
            }
            self.send(json!({"type": "input_audio_buffer.commit"})).await?;
        }

        Ok(())
    }

    async fn generate(
        &mut self,
        request: GenerationRequest<'_>,
        modalities: &[&str],
    ) -> Result<EventStream> {
        if self.live.as_ref().is_some_and(|l| l.reader.is_finished()) {
            tracing::info!("realtime connection dropped, reconnecting");
            self.drop_live();
        }
        if self.live.is_none() {
            self.connect(request.tools).await?;
            tracing::debug!(
                replay = request.context.len(),
                "replaying context on new realtime connection"
            );
        }

        let events = match self.live.as_ref() {
            Some(live) => Arc::clone(&live.events),
            None => return Err(Error::Stream("realtime connection not open".to_string())),
        };

        // Discard anything left over from an interrupted response
        {
            let mut rx = events.lock().await;
            while rx.try_recv().is_ok() {}
        }

        self.sync(request.context, request.audio).await?;
        self.send(json!({
            "type": "response.create",
            "response": {"modalities": modalities},
        }))
        .await?;

        let receiver = events.lock_owned().await;
        let state = ResponseState {
            receiver,
            items: Arc::clone(&self.items),
            message_id: request.response_id.to_string(),
            response_id: None,
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                let Some(next) = state.receiver.recv().await else {
                    state.finished = true;
                    let err = Error::Stream("realtime connection closed".to_string());
                    return Some((Err(err), state));
                };
                let event = match next {
                    Ok(event) => event,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                };
                match state.handle(&event) {
                    Ok(Some(out)) => {
                        if out == TransportEvent::Done {
                            state.finished = true;
                        }
                        return Some((Ok(out), state));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn interrupt(&mut self) -> Result<()> {
        if self.live.is_none() {
            return Ok(());
        }
        self.send(json!({"type": "response.cancel"})).await?;
        self.send(json!({"type": "input_audio_buffer.clear"})).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut live) = self.live.take() {
            let _ = live.sink.close().await;
            live.reader.abort();
            tracing::debug!("realtime session closed");
        }
        Ok(())
    }
}

/// Per-generation event filter
struct ResponseState {
    receiver: tokio::sync::OwnedMutexGuard<mpsc::UnboundedReceiver<Result<Value>>>,
    items: Arc<StdMutex<ItemMap>>,
    message_id: String,
    response_id: Option<String>,
    finished: bool,
}

impl ResponseState {
    /// Map one server event to a transport event for this response
    fn handle(&mut self, event: &Value) -> Result<Option<TransportEvent>> {
        let kind = event["type"].as_str().unwrap_or_default();

        match kind {
            "response.created" => {
                if self.response_id.is_none() {
                    self.response_id = event["response"]["id"].as_str().map(str::to_string);
                }
                return Ok(None);
            }
            "input_audio_buffer.committed" => {
                if let (Some(item_id), Ok(mut items)) = (event["item_id"].as_str(), self.items.lock())
                    && let Some(message_id) = items.pending_audio.take()
                {
                    items.record(&message_id, item_id);
                }
                return Ok(None);
            }
            "conversation.item.input_audio_transcription.completed" => {
                let transcript = event["transcript"].as_str().unwrap_or_default().trim();
                return Ok((!transcript.is_empty())
                    .then(|| TransportEvent::UserTranscript(transcript.to_string())));
            }
            "error" => {
                let error = &event["error"];
                let code = error["code"].as_str().unwrap_or_default();
                let message = error["message"].as_str().unwrap_or("realtime error");
                if BENIGN_ERROR_CODES.contains(&code) {
                    tracing::debug!(code, message, "ignoring realtime error");
                    return Ok(None);
                }
                return Err(Error::Stream(message.to_string()));
            }
            _ => {}
        }

        if !kind.starts_with("response.") {
            tracing::trace!(kind, "ignoring realtime event");
            return Ok(None);
        }

        // Only events for the response we started
        let event_response = event["response_id"]
            .as_str()
            .or_else(|| event["response"]["id"].as_str());
        if self.response_id.is_none() || event_response != self.response_id.as_deref() {
            tracing::trace!(kind, "event for another response");
            return Ok(None);
        }

        match kind {
            "response.output_item.added" => {
                if let (Some(item_id), Ok(mut items)) = (event["item"]["id"].as_str(), self.items.lock()) {
                    items.record(&self.message_id, item_id);
                }
                Ok(None)
            }
            "response.text.delta" | "response.audio_transcript.delta" => Ok(event["delta"]
                .as_str()
                .filter(|d| !d.is_empty())
                .map(|d| TransportEvent::TextDelta(d.to_string()))),
            "response.audio.delta" => {
                let samples = event["delta"].as_str().map(decode_pcm16).transpose()?;
                Ok(samples.map(TransportEvent::AudioDelta))
            }
            "response.function_call_arguments.done" => {
                let raw = event["arguments"].as_str().unwrap_or("{}");
                let arguments =
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                Ok(Some(TransportEvent::ToolCall(super::message::ToolCall {
                    id: event["call_id"].as_str().unwrap_or_default().to_string(),
                    name: event["name"].as_str().unwrap_or_default().to_string(),
                    arguments,
                })))
            }
            "response.done" => {
                let status = event["response"]["status"].as_str().unwrap_or("completed");
                if status == "failed" {
                    let detail = event["response"]["status_details"].to_string();
                    return Err(Error::Stream(format!("realtime response failed: {detail}")));
                }
                Ok(Some(TransportEvent::Done))
            }
            _ => {
                tracing::trace!(kind, "ignoring realtime event");
                Ok(None)
            }
        }
    }
}

/// Server items for one message, with stable ids derived from the message id
fn conversation_items(message: &Message) -> Vec<(String, Value)> {
    match message.role {
        Role::User => vec![(
            message.id.clone(),
            json!({
                "id": message.id,
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": message.content}],
            }),
        )],
        Role::Tool => vec![(
            message.id.clone(),
            json!({
                "id": message.id,
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.content,
            }),
        )],
        Role::Assistant => {
            let mut items = Vec::new();
            if !message.content.is_empty() {
                items.push((
                    message.id.clone(),
                    json!({
                        "id": message.id,
                        "type": "message",
                        "role": "assistant",
                        "content": [{"type": "text", "text": message.content}],
                    }),
                ));
            }
            for (i, call) in message.tool_calls.iter().enumerate() {
                let prefix: String = message.id.chars().take(30).collect();
                let item_id = format!("{prefix}{i:02}");
                items.push((
                    item_id.clone(),
                    json!({
                        "id": item_id,
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }),
                ));
            }
            items
        }
    }
}

/// f32 samples to base64 little-endian PCM16
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        #[allow(clippy::cast_possible_truncation)]
        let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Base64 little-endian PCM16 to f32 samples
///
/// # Errors
///
/// Returns `Error::Stream` if the payload is not valid base64
pub fn decode_pcm16(data: &str) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| Error::Stream(format!("invalid audio delta: {e}")))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect())
}

/// Text-only realtime session
pub struct RealtimeBasicTransport {
    conn: RealtimeConnection,
}

impl RealtimeBasicTransport {
    #[must_use]
    pub fn new(settings: RealtimeSettings) -> Self {
        let session = json!({"modalities": ["text"]});
        Self {
            conn: RealtimeConnection::new(settings, session),
        }
    }
}

#[async_trait]
impl ModelTransport for RealtimeBasicTransport {
    fn mode(&self) -> Mode {
        Mode::RealtimeBasic
    }

    async fn generate(&mut self, request: GenerationRequest<'_>) -> Result<EventStream> {
        // Audio is transcribed locally in this mode
        let request = GenerationRequest {
            audio: None,
            ..request
        };
        self.conn.generate(request, &["text"]).await
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.conn.interrupt().await
    }

    async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }
}

/// Audio-in, audio-out realtime session with barge-in
pub struct RealtimeAdvancedTransport {
    conn: RealtimeConnection,
}

impl RealtimeAdvancedTransport {
    #[must_use]
    pub fn new(settings: RealtimeSettings, voice: &str) -> Self {
        let session = json!({
            "modalities": ["text", "audio"],
            "voice": voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": {"model": "whisper-1"},
            // Buffers are committed explicitly after local segmentation
            "turn_detection": null,
        });
        Self {
            conn: RealtimeConnection::new(settings, session),
        }
    }
}

#[async_trait]
impl ModelTransport for RealtimeAdvancedTransport {
    fn mode(&self) -> Mode {
        Mode::RealtimeAdvanced
    }

    async fn generate(&mut self, request: GenerationRequest<'_>) -> Result<EventStream> {
        self.conn.generate(request, &["text", "audio"]).await
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.conn.interrupt().await
    }

    async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::message::ToolCall;

    fn state() -> ResponseState {
        let (_tx, rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(rx))
            .try_lock_owned()
            .unwrap();
        ResponseState {
            receiver,
            items: Arc::new(StdMutex::new(ItemMap::default())),
            message_id: "msg1".to_string(),
            response_id: None,
            finished: false,
        }
    }

    #[test]
    fn test_pcm16_round_trip_is_close() {
        let samples = vec![0.0, 0.5, -0.5, 0.999];
        let decoded = decode_pcm16(&encode_pcm16(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_events_filtered_to_current_response() {
        let mut state = state();

        let stale = json!({"type": "response.text.delta", "response_id": "old", "delta": "x"});
        assert_eq!(state.handle(&stale).unwrap(), None);

        state
            .handle(&json!({"type": "response.created", "response": {"id": "r1"}}))
            .unwrap();
        assert_eq!(state.handle(&stale).unwrap(), None);

        let delta = json!({"type": "response.text.delta", "response_id": "r1", "delta": "Hi"});
        assert_eq!(
            state.handle(&delta).unwrap(),
            Some(TransportEvent::TextDelta("Hi".into()))
        );

        let done = json!({"type": "response.done", "response": {"id": "r1", "status": "completed"}});
        assert_eq!(state.handle(&done).unwrap(), Some(TransportEvent::Done));
    }

    #[test]
    fn test_function_call_event() {
        let mut state = state();
        state
            .handle(&json!({"type": "response.created", "response": {"id": "r1"}}))
            .unwrap();

        let event = json!({
            "type": "response.function_call_arguments.done",
            "response_id": "r1",
            "call_id": "call_9",
            "name": "save_note",
            "arguments": "{\"text\":\"buy oat milk\"}",
        });
        assert_eq!(
            state.handle(&event).unwrap(),
            Some(TransportEvent::ToolCall(ToolCall {
                id: "call_9".into(),
                name: "save_note".into(),
                arguments: json!({"text": "buy oat milk"}),
            }))
        );
    }

    #[test]
    fn test_output_items_mapped_to_message() {
        let mut state = state();
        state
            .handle(&json!({"type": "response.created", "response": {"id": "r1"}}))
            .unwrap();
        state
            .handle(&json!({"type": "response.output_item.added", "response_id": "r1", "item": {"id": "item_a"}}))
            .unwrap();

        let items = state.items.lock().unwrap();
        assert_eq!(items.by_message["msg1"], vec!["item_a".to_string()]);
    }

    #[test]
    fn test_benign_error_ignored_fatal_surfaced() {
        let mut state = state();
        let benign = json!({"type": "error", "error": {"code": "response_cancel_not_active", "message": "no"}});
        assert_eq!(state.handle(&benign).unwrap(), None);

        let fatal = json!({"type": "error", "error": {"code": "server_error", "message": "boom"}});
        assert!(matches!(state.handle(&fatal), Err(Error::Stream(m)) if m == "boom"));
    }

    #[test]
    fn test_assistant_items_have_bounded_ids() {
        let mut msg = Message::assistant("sure");
        msg.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "save_note".into(),
            arguments: json!({}),
        });
        let items = conversation_items(&msg);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|(id, _)| id.len() <= 32));
        assert_eq!(items[1].1["type"], "function_call");
    }
}
