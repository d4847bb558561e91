//! Daemon - the orchestrator actor
//!
//! A single task owns the [`StateMachine`] and is the only place the status
//! changes. Every non-idle status runs exactly one stage task (capture,
//! processing or playback). Stage results come back tagged with the epoch
//! they were started in, so output from a cancelled stage is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ListeningConfig, LlmConfig, TtsConfig};
use crate::db::{self, HistoryStore, SqliteHistory, replay};
use crate::events::{self, Command, UiEvent};
use crate::pipeline::{PhraseFilter, Pipeline, PipelineOutcome, TurnInput};
use crate::session::{
    Mode, ModelTransport, RealtimeAdvancedTransport, RealtimeBasicTransport, RealtimeSettings,
    SessionManager, StreamTransport,
};
use crate::speaker::{PlaybackRequest, Speaker};
use crate::state::{Event, StateMachine, Status, Transition};
use crate::tools::SecureExecutor;
use crate::transcription::TranscriptionService;
use crate::trigger::{self, TriggerEvent};
use crate::voice::{
    CaptureOutcome, CaptureSource, Chime, DevicePlayback, FrameSource, ListeningPolicy,
    MicrophoneStream, SAMPLE_RATE, SegmentEvent, Segmenter, SegmenterConfig, SynthesizedAudio,
    Synthesizer, TextToSpeech, TtsProvider, Utterance, VoiceParams, WakeWordEngine,
    capture_utterance,
};
use crate::{Error, Result};

/// Time a cancelled stage gets to release its resources before it is aborted
pub const STAGE_GRACE: Duration = Duration::from_secs(2);

/// Buffered trigger events
const TRIGGER_CAPACITY: usize = 16;

/// Opens the microphone for one stage
#[async_trait]
pub trait MicrophoneFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn FrameSource>>;
}

/// The default input device
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceMicrophone;

#[async_trait]
impl MicrophoneFactory for DeviceMicrophone {
    async fn open(&self) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(MicrophoneStream::open().await?))
    }
}

/// Builds the model transport for a mode
pub trait TransportFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::Config` when the mode cannot be served
    fn build(&self, mode: Mode) -> Result<Box<dyn ModelTransport>>;
}

/// Transports for the configured model endpoints
pub struct ConfiguredTransports {
    llm: LlmConfig,
    api_key: Option<SecretString>,
}

impl ConfiguredTransports {
    #[must_use]
    pub const fn new(llm: LlmConfig, api_key: Option<SecretString>) -> Self {
        Self { llm, api_key }
    }
}

impl TransportFactory for ConfiguredTransports {
    fn build(&self, mode: Mode) -> Result<Box<dyn ModelTransport>> {
        let api_key = self.api_key.clone().ok_or_else(|| {
            Error::Config("OPENAI_API_KEY is required for the language model".to_string())
        })?;
        let realtime = RealtimeSettings {
            url: self.llm.realtime_url.clone(),
            model: self.llm.realtime_model.clone(),
            api_key: api_key.clone(),
            instructions: self.llm.instructions.clone(),
            temperature: self.llm.realtime_temperature,
        };

        Ok(match mode {
            Mode::Stream => Box::new(StreamTransport::new(
                self.llm.base_url.clone(),
                api_key,
                self.llm.model.clone(),
                self.llm.temperature,
                self.llm.instructions.clone(),
            )),
            Mode::RealtimeBasic => Box::new(RealtimeBasicTransport::new(realtime)),
            Mode::RealtimeAdvanced => Box::new(RealtimeAdvancedTransport::new(
                realtime,
                &self.llm.realtime_voice,
            )),
        })
    }
}

/// Collaborators the daemon drives
pub struct Components {
    pub microphone: Arc<dyn MicrophoneFactory>,
    pub transports: Arc<dyn TransportFactory>,
    pub transcription: Arc<TranscriptionService>,
    pub executor: Arc<SecureExecutor>,
    pub speaker: Arc<Speaker>,
    pub history: Option<Arc<dyn HistoryStore>>,
    pub wake: Option<WakeWordEngine>,
}

/// Behavior settings read at startup
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub mode: Mode,
    pub context_window: usize,
    pub max_tool_rounds: usize,
    pub listening: ListeningConfig,
    pub tts: TtsConfig,
    /// Chat whose recent messages seed the session
    pub resume_chat: Option<String>,
    pub stage_grace: Duration,
    /// Non-fatal setup problems shown once the UI is attached
    pub warnings: Vec<String>,
}

impl DaemonOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.mode,
            context_window: config.context_window,
            max_tool_rounds: config.llm.max_tool_rounds,
            listening: config.listening.clone(),
            tts: config.tts.clone(),
            resume_chat: None,
            stage_grace: STAGE_GRACE,
            warnings: Vec::new(),
        }
    }
}

/// Control surface for a running daemon
#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::Sender<Command>,
    triggers: mpsc::Sender<TriggerEvent>,
    ui: broadcast::Sender<UiEvent>,
}

impl DaemonHandle {
    /// Subscribe to UI events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    /// Send a command; returns false once the daemon has stopped
    pub async fn send(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Deliver a trigger; returns false once the daemon has stopped
    pub async fn trigger(&self, event: TriggerEvent) -> bool {
        self.triggers.send(event).await.is_ok()
    }

    /// Sender for trigger sources such as hotkeys
    #[must_use]
    pub fn triggers(&self) -> mpsc::Sender<TriggerEvent> {
        self.triggers.clone()
    }
}

/// Result reported by a stage task
#[derive(Debug)]
enum StageEvent {
    Captured(Utterance),
    /// Capture ended without speech; `stopped` when the user asked it to
    NoSpeech { stopped: bool },
    Processed(PipelineOutcome),
    PlaybackFinished,
    BargeIn,
    Failed(Error),
}

/// A running task and the tokens that end it
struct ActiveStage {
    cancel: CancellationToken,
    /// Finalizes capture early
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// The voice assistant orchestrator
pub struct Daemon {
    machine: StateMachine,
    mode: Mode,
    session: Arc<Mutex<SessionManager>>,
    pipeline: Arc<Pipeline>,
    speaker: Arc<Speaker>,
    microphone: Arc<dyn MicrophoneFactory>,
    transports: Arc<dyn TransportFactory>,
    history: Option<Arc<dyn HistoryStore>>,
    wake: Option<Arc<Mutex<WakeWordEngine>>>,
    wake_task: Option<ActiveStage>,
    options: DaemonOptions,
    ui: broadcast::Sender<UiEvent>,
    commands: mpsc::Receiver<Command>,
    triggers: mpsc::Receiver<TriggerEvent>,
    trigger_tx: mpsc::Sender<TriggerEvent>,
    stage_tx: mpsc::UnboundedSender<(u64, StageEvent)>,
    stage_rx: mpsc::UnboundedReceiver<(u64, StageEvent)>,
    active: Option<ActiveStage>,
    epoch: u64,
    origin: CaptureSource,
}

impl Daemon {
    /// Create a daemon and its control handle
    ///
    /// # Errors
    ///
    /// Returns error if the transport for the configured mode cannot be built
    pub fn new(components: Components, options: DaemonOptions) -> Result<(Self, DaemonHandle)> {
        let (ui, _) = events::ui_channel();
        let (command_tx, commands) = events::command_channel();
        let (trigger_tx, triggers) = mpsc::channel(TRIGGER_CAPACITY);
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();

        let transport = components.transports.build(options.mode)?;
        let mut session = SessionManager::new(
            transport,
            options.context_window,
            components.executor.definitions(),
        );
        if let Some(store) = &components.history {
            session = session.with_history(Arc::clone(store));
        }

        let pipeline = Pipeline::new(
            components.transcription,
            components.executor,
            PhraseFilter::new(&options.listening.stop_phrase, &options.listening.extend_phrase),
            options.max_tool_rounds,
            ui.clone(),
        );

        let handle = DaemonHandle {
            commands: command_tx,
            triggers: trigger_tx.clone(),
            ui: ui.clone(),
        };

        let daemon = Self {
            machine: StateMachine::new(options.listening.extended),
            mode: options.mode,
            session: Arc::new(Mutex::new(session)),
            pipeline: Arc::new(pipeline),
            speaker: components.speaker,
            microphone: components.microphone,
            transports: components.transports,
            history: components.history,
            wake: components.wake.map(|engine| Arc::new(Mutex::new(engine))),
            wake_task: None,
            options,
            ui,
            commands,
            triggers,
            trigger_tx,
            stage_tx,
            stage_rx,
            active: None,
            epoch: 0,
            origin: CaptureSource::Command,
        };
        Ok((daemon, handle))
    }

    /// Build the daemon from configuration with device-backed components
    ///
    /// # Errors
    ///
    /// Returns error if a required component cannot be initialized
    pub fn from_config(config: &Config) -> Result<(Self, DaemonHandle)> {
        let mut options = DaemonOptions::from_config(config);

        let transcription = Arc::new(TranscriptionService::from_config(&config.stt, &config.api_keys)?);

        let executor = SecureExecutor::from_config(config.tools.clone(), &config.sandbox);
        for (name, e) in executor.check_all() {
            tracing::warn!(tool = %name, error = %e, "tool body will be refused");
            options.warnings.push(format!("Tool {name} will be refused: {e}"));
        }

        let synthesizer = if config.tts.enabled {
            let key = match config.tts.provider {
                TtsProvider::OpenAi => config.api_keys.openai.clone(),
                TtsProvider::ElevenLabs => config.api_keys.elevenlabs.clone(),
            };
            match key {
                Some(key) => {
                    let tts = TextToSpeech::new(config.tts.provider, key, config.tts.model.clone())?;
                    Some(Arc::new(tts) as Arc<dyn Synthesizer>)
                }
                None => {
                    options
                        .warnings
                        .push("No TTS credential configured, replies will not be spoken".to_string());
                    None
                }
            }
        } else {
            None
        };
        let speaker = Arc::new(Speaker::new(synthesizer, Arc::new(DevicePlayback::new())));

        std::fs::create_dir_all(&config.data_dir)?;
        let history = SqliteHistory::new(db::init(config.database_path())?);
        options.resume_chat = history.latest_chat().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to read latest chat");
            None
        });

        let wake = match trigger::wake_engine(&config.trigger, &config.api_keys) {
            Ok(engine) => engine,
            Err(Error::ConfigurationWarning(reason)) => {
                tracing::warn!(reason = %reason, "wake phrase disabled");
                options.warnings.push(reason);
                None
            }
            Err(e) => return Err(e),
        };

        let components = Components {
            microphone: Arc::new(DeviceMicrophone),
            transports: Arc::new(ConfiguredTransports::new(
                config.llm.clone(),
                config.api_keys.openai.clone(),
            )),
            transcription,
            executor: Arc::new(executor),
            speaker,
            history: Some(Arc::new(history)),
            wake,
        };
        Self::new(components, options)
    }

    /// Run until a shutdown command arrives or every handle is dropped
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to close cleanly
    pub async fn run(mut self) -> Result<()> {
        self.restore_history().await;
        for reason in std::mem::take(&mut self.options.warnings) {
            self.emit(UiEvent::Warning { reason });
        }
        self.emit(UiEvent::ModeChanged(self.mode));
        self.emit(UiEvent::Status(Status::Idle));
        self.start_wake();
        tracing::info!(mode = %self.mode, "daemon running");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(trigger) = self.triggers.recv() => self.on_trigger(trigger).await,
                Some((epoch, event)) = self.stage_rx.recv() => {
                    if epoch == self.epoch {
                        self.active = None;
                        self.on_stage(event).await;
                    } else {
                        tracing::debug!(epoch, current = self.epoch, "dropping result of cancelled stage");
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn restore_history(&self) {
        let (Some(store), Some(chat_id)) = (&self.history, &self.options.resume_chat) else {
            return;
        };
        match store.recent(chat_id, self.options.context_window) {
            Ok(stored) if !stored.is_empty() => {
                self.session.lock().await.seed(chat_id.clone(), replay(stored));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to replay history"),
        }
    }

    async fn on_command(&mut self, command: Command) {
        tracing::debug!(command = ?command, status = %self.machine.status(), "command received");
        match command {
            Command::Start => self.request_start(CaptureSource::Command).await,
            Command::Stop => self.request_stop().await,
            Command::Cancel => self.cancel().await,
            Command::SwitchMode(mode) => self.switch_mode(mode).await,
            Command::SubmitText(text) => self.submit_text(text).await,
            Command::NewSession => self.new_session().await,
            Command::Shutdown => {}
        }
    }

    async fn on_trigger(&mut self, trigger: TriggerEvent) {
        match trigger {
            TriggerEvent::WakePhrase(detection) => {
                let transition = self.machine.apply(Event::WakeDetected);
                if transition == Transition::Ignored {
                    return;
                }
                tracing::info!(keyword = %detection.keyword_id, "starting capture on wake phrase");
                self.stop_wake().await;
                self.origin = CaptureSource::WakeWord;
                self.publish(transition);
                self.begin_listening();
            }
            TriggerEvent::HotkeyStart => self.request_start(CaptureSource::Hotkey).await,
            TriggerEvent::HotkeyStop => self.request_stop().await,
        }
    }

    async fn on_stage(&mut self, event: StageEvent) {
        match event {
            StageEvent::Captured(utterance) => {
                let transition = self.machine.apply(Event::UtteranceCaptured);
                if transition != Transition::Ignored {
                    self.publish(transition);
                    self.begin_processing(TurnInput::Speech(utterance));
                }
            }
            StageEvent::NoSpeech { stopped } => {
                // An explicit stop ends even an extended session
                let event = if stopped { Event::Cancel } else { Event::NoSpeech };
                let transition = self.machine.apply(event);
                self.settle(transition);
            }
            StageEvent::Processed(outcome) => self.on_processed(outcome),
            StageEvent::PlaybackFinished => {
                let transition = self.machine.apply(Event::PlaybackFinished);
                self.settle(transition);
            }
            StageEvent::BargeIn => {
                let transition = self.machine.apply(Event::BargeIn);
                if transition == Transition::Ignored {
                    return;
                }
                tracing::info!("barge-in, interrupting assistant");
                if let Err(e) = self.session.lock().await.interrupt().await {
                    tracing::debug!(error = %e, "interrupt after barge-in failed");
                }
                self.origin = CaptureSource::Command;
                self.publish(transition);
                self.begin_listening();
            }
            StageEvent::Failed(Error::Cancelled) => {
                tracing::debug!("stage reported cancellation");
            }
            StageEvent::Failed(e) => {
                tracing::warn!(error = %e, status = %self.machine.status(), "stage failed");
                self.emit(UiEvent::Error {
                    reason: e.user_message(),
                });
                let transition = self.machine.apply(Event::Failed);
                self.settle(transition);
            }
        }
    }

    fn on_processed(&mut self, outcome: PipelineOutcome) {
        match outcome {
            PipelineOutcome::StopPhrase => {
                let transition = self.machine.apply(Event::StopPhrase);
                self.settle(transition);
            }
            PipelineOutcome::NothingToSay { extend } => {
                if extend {
                    self.machine.extend();
                }
                let transition = self.machine.apply(Event::NothingToSay);
                self.settle(transition);
            }
            PipelineOutcome::Reply {
                text, audio, extend, ..
            } => {
                if extend {
                    self.machine.extend();
                }
                let request = self.playback_request(text, audio);
                let transition = self.machine.apply(Event::ReplyReady {
                    speak: request.is_some(),
                });
                match (transition, request) {
                    (
                        Transition::Moved {
                            to: Status::Speaking,
                            ..
                        },
                        Some(request),
                    ) => {
                        self.publish(transition);
                        self.begin_speaking(request);
                    }
                    (transition, _) => self.settle(transition),
                }
            }
        }
    }

    /// Start listening, restarting if a stage is active
    async fn request_start(&mut self, origin: CaptureSource) {
        let transition = self.machine.apply(Event::StartRequested);
        match transition {
            Transition::Ignored => return,
            Transition::Restarted { .. } => {
                self.cancel_active().await;
                self.speaker.stop();
            }
            Transition::Moved { .. } => self.stop_wake().await,
        }
        self.origin = origin;
        self.publish(transition);
        self.begin_listening();
    }

    /// Finalize a capture in progress, or cancel anything else
    async fn request_stop(&mut self) {
        match self.machine.status() {
            Status::Idle => tracing::debug!("stop ignored while idle"),
            Status::Listening => {
                if let Some(stage) = &self.active {
                    tracing::debug!("finalizing capture");
                    stage.stop.cancel();
                }
            }
            Status::Processing | Status::Speaking => self.cancel().await,
        }
    }

    async fn cancel(&mut self) {
        let transition = self.machine.apply(Event::Cancel);
        if transition == Transition::Ignored {
            return;
        }
        tracing::info!("cancelled by user");
        self.cancel_active().await;
        self.speaker.stop();
        self.settle(transition);
    }

    async fn switch_mode(&mut self, mode: Mode) {
        if self.machine.status() != Status::Idle {
            self.emit(UiEvent::Warning {
                reason: "Modes can only be switched between turns".to_string(),
            });
            return;
        }
        if mode == self.mode {
            return;
        }

        let result = match self.transports.build(mode) {
            Ok(transport) => self.session.lock().await.switch_mode(transport).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.mode = mode;
                self.emit(UiEvent::ModeChanged(mode));
            }
            Err(e) => {
                tracing::warn!(error = %e, mode = %mode, "mode switch failed");
                self.emit(UiEvent::Error {
                    reason: e.user_message(),
                });
            }
        }
    }

    async fn submit_text(&mut self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let transition = self.machine.apply(Event::TextSubmitted);
        if transition == Transition::Ignored {
            return;
        }
        self.stop_wake().await;
        self.publish(transition);
        self.begin_processing(TurnInput::Text(text));
    }

    async fn new_session(&mut self) {
        if self.machine.status() != Status::Idle {
            self.emit(UiEvent::Warning {
                reason: "Finish or cancel the current turn before starting a new conversation"
                    .to_string(),
            });
            return;
        }
        self.session.lock().await.reset();
    }

    async fn shutdown(mut self) -> Result<()> {
        tracing::info!("shutting down");
        self.cancel_active().await;
        self.stop_wake().await;
        self.speaker.stop();
        self.session.lock().await.close().await
    }

    fn playback_request(&self, text: String, audio: Vec<f32>) -> Option<PlaybackRequest> {
        let tts = &self.options.tts;
        if !tts.enabled {
            return None;
        }
        let prerendered = (!audio.is_empty()).then(|| SynthesizedAudio {
            samples: audio,
            sample_rate: SAMPLE_RATE,
        });
        if prerendered.is_none() && (text.trim().is_empty() || !self.speaker.can_synthesize()) {
            return None;
        }
        Some(PlaybackRequest {
            text,
            voice: VoiceParams {
                voice: tts.voice.clone(),
                speed: tts.speed,
            },
            volume: tts.volume,
            prerendered,
        })
    }

    /// Publish the status after a transition and start what it implies
    fn settle(&mut self, transition: Transition) {
        if transition == Transition::Ignored {
            return;
        }
        self.publish(transition);
        match self.machine.status() {
            Status::Listening => {
                self.origin = CaptureSource::Command;
                self.begin_listening();
            }
            Status::Idle => self.start_wake(),
            Status::Processing | Status::Speaking => {}
        }
    }

    fn publish(&self, transition: Transition) {
        match transition {
            Transition::Ignored => return,
            // Extended listening re-armed after a quiet window
            Transition::Moved { from, to } if from == to => return,
            Transition::Moved { from, to } => self.chime(from, to),
            Transition::Restarted { .. } => {}
        }
        self.emit(UiEvent::Status(self.machine.status()));
    }

    /// Cue the opening and closing of a listening session
    fn chime(&self, from: Status, to: Status) {
        if !self.options.listening.chimes {
            return;
        }
        let chime = match (from, to) {
            (Status::Idle, Status::Listening) => Chime::Start,
            (_, Status::Idle) => Chime::Stop,
            _ => return,
        };
        let speaker = Arc::clone(&self.speaker);
        let volume = self.options.tts.volume;
        tokio::spawn(async move {
            if let Err(e) = speaker.cue(chime.render(SAMPLE_RATE), SAMPLE_RATE, volume).await {
                tracing::debug!(error = %e, chime = ?chime, "chime failed");
            }
        });
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    fn begin_listening(&mut self) {
        let policy = if self.machine.is_extended() {
            ListeningPolicy::Extended
        } else {
            ListeningPolicy::SingleShot
        };
        let config = SegmenterConfig::from_listening(&self.options.listening, policy);
        let microphone = Arc::clone(&self.microphone);
        let origin = self.origin;

        self.spawn_stage(move |stop, cancel| async move {
            let mut source = match microphone.open().await {
                Ok(source) => source,
                Err(e) => return StageEvent::Failed(e),
            };
            let segmenter = Segmenter::new(config);
            match capture_utterance(source.as_mut(), segmenter, origin, &stop, &cancel).await {
                Ok(CaptureOutcome::Utterance(utterance)) => StageEvent::Captured(utterance),
                Ok(CaptureOutcome::NoSpeech) => StageEvent::NoSpeech {
                    stopped: stop.is_cancelled(),
                },
                Err(e) => StageEvent::Failed(e),
            }
        });
    }

    fn begin_processing(&mut self, input: TurnInput) {
        let session = Arc::clone(&self.session);
        let pipeline = Arc::clone(&self.pipeline);

        self.spawn_stage(move |_stop, cancel| async move {
            let mut session = session.lock().await;
            match pipeline.run(input, &mut session, &cancel).await {
                Ok(outcome) => StageEvent::Processed(outcome),
                Err(e) => StageEvent::Failed(e),
            }
        });
    }

    fn begin_speaking(&mut self, request: PlaybackRequest) {
        let speaker = Arc::clone(&self.speaker);
        let ui = self.ui.clone();
        let barge_in = (self.mode == Mode::RealtimeAdvanced)
            .then(|| (Arc::clone(&self.microphone), self.options.listening.clone()));

        self.spawn_stage(move |_stop, cancel| async move {
            let playback = cancel.child_token();
            let speaking = speaker.speak(request, &playback);
            tokio::pin!(speaking);
            let finished = tokio::select! {
                result = &mut speaking => Some(result),
                () = watch_barge_in(barge_in, cancel.clone()) => None,
            };

            match finished {
                None => {
                    // Let the output wind down before capture takes over
                    playback.cancel();
                    let _ = speaking.await;
                    StageEvent::BargeIn
                }
                Some(Ok(outcome)) => {
                    tracing::debug!(outcome = ?outcome, "playback ended");
                    StageEvent::PlaybackFinished
                }
                Some(Err(e)) => {
                    // Speech failures never fail the turn
                    tracing::warn!(error = %e, "playback failed");
                    let _ = ui.send(UiEvent::Warning {
                        reason: e.user_message(),
                    });
                    StageEvent::PlaybackFinished
                }
            }
        });
    }

    fn spawn_stage<F, Fut>(&mut self, stage: F)
    where
        F: FnOnce(CancellationToken, CancellationToken) -> Fut,
        Fut: Future<Output = StageEvent> + Send + 'static,
    {
        self.epoch += 1;
        let epoch = self.epoch;
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let events = self.stage_tx.clone();

        let task = stage(stop.clone(), cancel.clone());
        let handle = tokio::spawn(async move {
            let event = task.await;
            let _ = events.send((epoch, event));
        });

        self.active = Some(ActiveStage {
            cancel,
            stop,
            handle,
        });
    }

    /// Cancel the active stage and wait for it to release its resources
    async fn cancel_active(&mut self) {
        self.epoch += 1;
        if let Some(stage) = self.active.take() {
            release(stage, self.options.stage_grace, "active stage").await;
        }
    }

    /// Watch for the wake phrase while idle
    fn start_wake(&mut self) {
        let Some(engine) = &self.wake else {
            return;
        };
        if self.machine.status() != Status::Idle
            || self.wake_task.as_ref().is_some_and(|t| !t.handle.is_finished())
        {
            return;
        }

        let engine = Arc::clone(engine);
        let microphone = Arc::clone(&self.microphone);
        let triggers = self.trigger_tx.clone();
        let ui = self.ui.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut source = match microphone.open().await {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!(error = %e, "wake phrase listener could not open microphone");
                    let _ = ui.send(UiEvent::Warning {
                        reason: format!("Wake phrase paused: {}", e.user_message()),
                    });
                    return;
                }
            };
            let mut engine = engine.lock().await;
            match trigger::wait_for_wake(&mut engine, source.as_mut(), &token).await {
                Ok(Some(event)) => {
                    let _ = triggers.send(event).await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "wake phrase listener stopped"),
            }
        });

        self.wake_task = Some(ActiveStage {
            cancel,
            stop: CancellationToken::new(),
            handle,
        });
    }

    /// Release the microphone held by the wake listener
    async fn stop_wake(&mut self) {
        if let Some(task) = self.wake_task.take() {
            release(task, self.options.stage_grace, "wake listener").await;
        }
    }
}

async fn release(stage: ActiveStage, grace: Duration, name: &str) {
    stage.cancel.cancel();
    let mut handle = stage.handle;
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        tracing::warn!(stage = name, grace_ms = grace.as_millis(), "stage did not release in time, aborting");
        handle.abort();
    }
}

/// Resolve when the user starts speaking; never resolves without a microphone
async fn watch_barge_in(
    input: Option<(Arc<dyn MicrophoneFactory>, ListeningConfig)>,
    cancel: CancellationToken,
) {
    let Some((microphone, listening)) = input else {
        return std::future::pending().await;
    };
    let mut source = match microphone.open().await {
        Ok(source) => source,
        Err(e) => {
            tracing::debug!(error = %e, "barge-in disabled for this reply");
            return std::future::pending().await;
        }
    };

    let mut config = SegmenterConfig::from_listening(&listening, ListeningPolicy::SingleShot);
    config.max_wait_frames = usize::MAX;
    let mut segmenter = Segmenter::new(config);

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return std::future::pending().await,
            frame = source.next_frame() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if segmenter.push(&frame) == SegmentEvent::SpeechStarted {
                    return;
                }
            }
            Ok(None) | Err(_) => return std::future::pending().await,
        }
    }
}
