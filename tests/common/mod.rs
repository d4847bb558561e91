//! Shared test utilities
//!
//! Scripted stand-ins for the microphone, speech engines, model transport,
//! speaker and desktop so the orchestrator can run without hardware or
//! network access.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hark::config::{ListeningConfig, TtsConfig};
use hark::daemon::{Components, DaemonOptions, MicrophoneFactory, TransportFactory};
use hark::db::{self, HistoryStore, SqliteHistory};
use hark::events::UiEvent;
use hark::session::{
    EventStream, GenerationRequest, Mode, ModelTransport, Role, ToolCall, TransportEvent,
};
use hark::speaker::Speaker;
use hark::state::Status;
use hark::tools::{CapabilitySet, Host, SandboxTier, SecureExecutor, ToolDefinition};
use hark::transcription::{EngineTranscript, RetryPolicy, SpeechEngine, TranscriptionService};
use hark::voice::{
    AudioSink, FRAME_SAMPLES, Frame, FrameSource, SAMPLE_RATE, SynthesizedAudio, Synthesizer,
    VoiceParams, WakeWordEngine,
};
use hark::{Daemon, DaemonHandle, Error, Result};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// `count` frames of loud audio
pub fn speech(count: usize) -> Vec<Frame> {
    (0..count)
        .map(|_| generate_sine_samples(440.0, 0.025, 0.3)[..FRAME_SAMPLES].to_vec())
        .collect()
}

/// `count` frames of silence
pub fn silence(count: usize) -> Vec<Frame> {
    vec![vec![0.0; FRAME_SAMPLES]; count]
}

/// Concatenate frame runs
pub fn frames(parts: &[Vec<Frame>]) -> Vec<Frame> {
    parts.concat()
}

/// Frame source that plays a fixed script
///
/// Once the script is used up it either ends the stream or blocks forever,
/// like an open microphone in a quiet room.
pub struct ScriptedSource {
    frames: VecDeque<Frame>,
    hang: bool,
}

impl ScriptedSource {
    pub fn ending(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            hang: false,
        }
    }

    pub fn hanging(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            hang: true,
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.frames.pop_front() {
            tokio::task::yield_now().await;
            return Ok(Some(frame));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }
}

/// Microphone that hands out one script per open
///
/// Opens beyond the scripts get a source that never produces a frame.
#[derive(Default)]
pub struct ScriptedMic {
    scripts: Mutex<VecDeque<Vec<Frame>>>,
    opens: AtomicUsize,
}

impl ScriptedMic {
    pub fn new(scripts: Vec<Vec<Frame>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MicrophoneFactory for ScriptedMic {
    async fn open(&self) -> Result<Box<dyn FrameSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        Ok(Box::new(match script {
            Some(frames) => ScriptedSource::ending(frames),
            None => ScriptedSource::hanging(Vec::new()),
        }))
    }
}

/// Speech engine that returns scripted results in order
pub struct ScriptedEngine {
    name: String,
    results: Mutex<VecDeque<Result<EngineTranscript>>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(name: &str, results: Vec<Result<EngineTranscript>>) -> Self {
        Self {
            name: name.to_string(),
            results: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Engine that always hears `text`
    pub fn hearing(text: &str) -> Self {
        Self::new("scripted", vec![Ok(EngineTranscript::new(text))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<EngineTranscript> {
        assert!(wav.starts_with(b"RIFF"), "engines receive WAV audio");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().unwrap();
        // The last result repeats once the script runs out
        if results.len() > 1 {
            results.pop_front().unwrap()
        } else {
            match results.front() {
                Some(Ok(transcript)) => Ok(transcript.clone()),
                Some(Err(e)) => Err(clone_error(e)),
                None => Ok(EngineTranscript::new("")),
            }
        }
    }
}

fn clone_error(e: &Error) -> Error {
    match e {
        Error::Transcription { reason, detail } => Error::transcription(*reason, detail.clone()),
        other => Error::Stream(other.to_string()),
    }
}

/// What a transport saw for one generation
#[derive(Debug, Clone)]
pub struct SeenRequest {
    /// Role and content of every context message
    pub context: Vec<(Role, String)>,
    pub tools: Vec<String>,
    pub audio_samples: Option<usize>,
}

/// Shared script and log for [`ScriptedTransport`]
///
/// An empty batch stands for a generation that never produces anything.
#[derive(Default)]
pub struct TransportScript {
    batches: Mutex<VecDeque<Vec<Result<TransportEvent>>>>,
    seen: Mutex<Vec<SeenRequest>>,
    interrupts: AtomicUsize,
    closes: AtomicUsize,
    built: Mutex<Vec<Mode>>,
}

impl TransportScript {
    pub fn new(batches: Vec<Vec<Result<TransportEvent>>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            ..Self::default()
        })
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn built(&self) -> Vec<Mode> {
        self.built.lock().unwrap().clone()
    }
}

/// A reply made of text deltas
pub fn text_reply(parts: &[&str]) -> Vec<Result<TransportEvent>> {
    parts
        .iter()
        .map(|p| Ok(TransportEvent::TextDelta((*p).to_string())))
        .chain(std::iter::once(Ok(TransportEvent::Done)))
        .collect()
}

/// A reply that calls one tool
pub fn tool_reply(id: &str, name: &str, arguments: serde_json::Value) -> Vec<Result<TransportEvent>> {
    vec![
        Ok(TransportEvent::ToolCall(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        })),
        Ok(TransportEvent::Done),
    ]
}

/// Model transport driven by a [`TransportScript`]
pub struct ScriptedTransport {
    mode: Mode,
    script: Arc<TransportScript>,
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn mode(&self) -> Mode {
        self.mode
    }

    async fn generate(&mut self, request: GenerationRequest<'_>) -> Result<EventStream> {
        self.script.seen.lock().unwrap().push(SeenRequest {
            context: request
                .context
                .iter()
                .map(|m| (m.role, m.content.clone()))
                .collect(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
            audio_samples: request.audio.map(<[f32]>::len),
        });

        let batch = self.script.batches.lock().unwrap().pop_front();
        match batch {
            Some(events) if events.is_empty() => Ok(futures::stream::pending().boxed()),
            Some(events) => Ok(futures::stream::iter(events).boxed()),
            None => Ok(futures::stream::iter(text_reply(&["ok"])).boxed()),
        }
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.script.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds transports that share one script
pub struct ScriptedTransports(pub Arc<TransportScript>);

impl TransportFactory for ScriptedTransports {
    fn build(&self, mode: Mode) -> Result<Box<dyn ModelTransport>> {
        self.0.built.lock().unwrap().push(mode);
        Ok(Box::new(ScriptedTransport {
            mode,
            script: Arc::clone(&self.0),
        }))
    }
}

/// Audio sink that records what it was asked to play
///
/// Each play lasts `duration` unless cancelled.
pub struct RecordingSink {
    duration: Duration,
    played: Mutex<Vec<(usize, u32)>>,
    cancelled: AtomicUsize,
}

impl RecordingSink {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            played: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn played(&self) -> Vec<(usize, u32)> {
        self.played.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, samples: Vec<f32>, sample_rate: u32, cancel: CancellationToken) -> Result<()> {
        self.played.lock().unwrap().push((samples.len(), sample_rate));
        tokio::select! {
            () = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            () = tokio::time::sleep(self.duration) => {}
        }
        Ok(())
    }
}

/// Synthesizer producing a short tone, or failing
pub struct ToneSynth {
    fail: bool,
    texts: Mutex<Vec<String>>,
}

impl ToneSynth {
    pub fn new() -> Self {
        Self {
            fail: false,
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ToneSynth {
    async fn synthesize(&self, text: &str, _params: &VoiceParams) -> Result<SynthesizedAudio> {
        self.texts.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(Error::Tts("provider returned 500".to_string()));
        }
        Ok(SynthesizedAudio {
            samples: generate_sine_samples(440.0, 0.1, 0.2),
            sample_rate: SAMPLE_RATE,
        })
    }
}

/// Desktop host that records side effects in memory
#[derive(Default)]
pub struct MemoryHost {
    clipboard: Mutex<String>,
    pub pasted: Mutex<Vec<String>>,
    pub typed: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<(String, String)>>,
}

impl MemoryHost {
    pub fn pasted(&self) -> Vec<String> {
        self.pasted.lock().unwrap().clone()
    }
}

impl Host for MemoryHost {
    fn clipboard_set(&self, text: &str) -> Result<()> {
        text.clone_into(&mut self.clipboard.lock().unwrap());
        Ok(())
    }

    fn clipboard_get(&self) -> Result<String> {
        Ok(self.clipboard.lock().unwrap().clone())
    }

    fn keyboard_paste(&self, text: &str) -> Result<()> {
        self.pasted.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn keyboard_type(&self, text: &str) -> Result<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn notify(&self, title: &str, body: &str) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        Ok(())
    }

    fn http_get(&self, url: &str) -> Result<String> {
        Err(Error::Tool(format!("offline: {url}")))
    }

    fn read_file(&self, path: &str) -> Result<String> {
        Err(Error::Tool(format!("no such file: {path}")))
    }

    fn run_process(&self, program: &str, _args: &[String], _timeout: Duration) -> Result<String> {
        Err(Error::Tool(format!("cannot run {program}")))
    }
}

/// The note-taking tool used across scenarios
pub fn save_note_tool() -> ToolDefinition {
    ToolDefinition::new(
        "save_note",
        "Paste a note into the focused window",
        Some(serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })),
        "let note = \"Note: \" + args.text\nkeyboard.paste(note)\nreturn \"Note pasted!\"",
    )
}

/// Executor over an in-memory host with the desktop capabilities
pub fn executor(tools: Vec<ToolDefinition>, host: Arc<MemoryHost>) -> SecureExecutor {
    SecureExecutor::new(
        tools,
        CapabilitySet::desktop_default(),
        SandboxTier::InProcess,
        Duration::from_secs(2),
        host,
    )
}

/// Retries without real waiting
pub fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
    }
}

/// Everything a daemon scenario can observe
pub struct Rig {
    pub handle: DaemonHandle,
    pub events: broadcast::Receiver<UiEvent>,
    pub mic: Arc<ScriptedMic>,
    pub transport: Arc<TransportScript>,
    pub host: Arc<MemoryHost>,
    pub sink: Arc<RecordingSink>,
    pub synth: Arc<ToneSynth>,
    pub history: SqliteHistory,
    pub task: tokio::task::JoinHandle<Result<()>>,
}

/// Builder for a daemon wired to scripted components
pub struct RigBuilder {
    pub mic_scripts: Vec<Vec<Frame>>,
    pub local_stt: Option<Arc<ScriptedEngine>>,
    pub cloud_stt: Option<Arc<ScriptedEngine>>,
    pub retry: RetryPolicy,
    pub batches: Vec<Vec<Result<TransportEvent>>>,
    pub tools: Vec<ToolDefinition>,
    pub synth: ToneSynth,
    pub playback: Duration,
    pub wake: Option<WakeWordEngine>,
    pub mode: Mode,
    pub listening: ListeningConfig,
    pub tts: TtsConfig,
    /// Store to use instead of a fresh in-memory one
    pub history: Option<SqliteHistory>,
    pub resume_chat: Option<String>,
}

impl Default for RigBuilder {
    fn default() -> Self {
        Self {
            mic_scripts: Vec::new(),
            local_stt: Some(Arc::new(ScriptedEngine::hearing(""))),
            cloud_stt: None,
            retry: quick_retry(0),
            batches: Vec::new(),
            tools: vec![save_note_tool()],
            synth: ToneSynth::new(),
            playback: Duration::from_millis(20),
            wake: None,
            mode: Mode::Stream,
            listening: ListeningConfig {
                chimes: false,
                ..ListeningConfig::default()
            },
            tts: TtsConfig::default(),
            history: None,
            resume_chat: None,
        }
    }
}

impl RigBuilder {
    /// Start the daemon on the current runtime
    pub fn start(self) -> Rig {
        let mic = Arc::new(ScriptedMic::new(self.mic_scripts));
        let transport = TransportScript::new(self.batches);
        let host = Arc::new(MemoryHost::default());
        let sink = Arc::new(RecordingSink::new(self.playback));
        let synth = Arc::new(self.synth);
        let history = self
            .history
            .unwrap_or_else(|| SqliteHistory::new(db::init_memory().unwrap()));

        let local = self.local_stt.map(|e| e as Arc<dyn SpeechEngine>);
        let cloud = self.cloud_stt.map(|e| e as Arc<dyn SpeechEngine>);

        let components = Components {
            microphone: Arc::clone(&mic) as Arc<dyn MicrophoneFactory>,
            transports: Arc::new(ScriptedTransports(Arc::clone(&transport))),
            transcription: Arc::new(TranscriptionService::new(local, cloud, self.retry)),
            executor: Arc::new(executor(self.tools, Arc::clone(&host))),
            speaker: Arc::new(Speaker::new(
                Some(Arc::clone(&synth) as Arc<dyn Synthesizer>),
                Arc::clone(&sink) as Arc<dyn AudioSink>,
            )),
            history: Some(Arc::new(history.clone()) as Arc<dyn HistoryStore>),
            wake: self.wake,
        };
        let options = DaemonOptions {
            mode: self.mode,
            context_window: 10,
            max_tool_rounds: 4,
            listening: self.listening,
            tts: self.tts,
            resume_chat: self.resume_chat,
            stage_grace: Duration::from_millis(500),
            warnings: Vec::new(),
        };

        let (daemon, handle) = Daemon::new(components, options).unwrap();
        let events = handle.subscribe();
        let task = tokio::spawn(daemon.run());

        Rig {
            handle,
            events,
            mic,
            transport,
            host,
            sink,
            synth,
            history,
            task,
        }
    }
}

impl Rig {
    /// Collect events until `done` matches one, failing after a few seconds
    pub async fn until(&mut self, done: impl Fn(&UiEvent) -> bool) -> Vec<UiEvent> {
        let mut seen = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        let finished = done(&event);
                        seen.push(event);
                        if finished {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting; saw {seen:?}");
        seen
    }

    /// Collect events until the daemon reports `status`
    pub async fn until_status(&mut self, status: Status) -> Vec<UiEvent> {
        self.until(|e| *e == UiEvent::Status(status)).await
    }

    /// Shut the daemon down and wait for it to exit
    pub async fn shutdown(self) {
        self.handle.send(hark::events::Command::Shutdown).await;
        let result = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))), "daemon did not shut down cleanly");
    }
}

/// Statuses in the order they were published
pub fn statuses(events: &[UiEvent]) -> Vec<Status> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::Status(status) => Some(*status),
            _ => None,
        })
        .collect()
}
