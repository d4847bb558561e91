use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hark::db::{self, SqliteHistory};
use hark::events::{Command as UiCommand, UiEvent};
use hark::tools::{DesktopHost, SandboxRequest, SecureExecutor, ToolReply, run_request};
use hark::trigger::HotkeyListener;
use hark::voice::{
    AudioSink, DevicePlayback, FrameSource, MicrophoneStream, SAMPLE_RATE, Synthesizer,
    TextToSpeech, TtsProvider, VoiceParams, apply_volume, calculate_energy, sine_tone,
};
use hark::{Config, Daemon};

/// Hark - voice interaction orchestrator
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant with a console UI (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Statically check every configured tool body
    CheckTools,
    /// List recent chats
    History {
        /// Print the messages of one chat
        #[arg(long)]
        show: Option<String>,
        /// Number of chats to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Run one sandboxed tool call read from stdin
    #[command(name = "sandbox-exec", hide = true)]
    SandboxExec,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,hark=info",
        1 => "info,hark=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_console().await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&text).await,
        Command::CheckTools => check_tools(),
        Command::History { show, limit } => history(show.as_deref(), limit),
        Command::SandboxExec => tokio::task::spawn_blocking(sandbox_exec).await?,
    }
}

/// Run the daemon, printing UI events and reading commands from stdin
async fn run_console() -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let (daemon, handle) = Daemon::from_config(&config)?;

    let _hotkeys = match HotkeyListener::spawn(
        &config.trigger.hotkey_start,
        &config.trigger.hotkey_stop,
        handle.triggers(),
    ) {
        Ok(listener) => Some(listener),
        Err(e) => {
            tracing::warn!(error = %e, "continuing without global hotkeys");
            None
        }
    };

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        let mut streaming = false;
        loop {
            match events.recv().await {
                Ok(UiEvent::AssistantDelta { text }) => {
                    if !streaming {
                        eprint!("assistant: ");
                        streaming = true;
                    }
                    eprint!("{text}");
                }
                Ok(event) => {
                    if streaming {
                        eprintln!();
                        streaming = false;
                    }
                    match event {
                        UiEvent::AssistantFinal { truncated: true, .. } => {
                            println!("(reply cut off)");
                        }
                        UiEvent::AssistantFinal { .. } => {}
                        event => println!("{event}"),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "console fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let input = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match UiCommand::from_console_line(&line) {
                Ok(Some(command)) => {
                    if !input.send(command).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(reason) => eprintln!("{reason}"),
            }
        }
        input.send(UiCommand::Shutdown).await;
    });

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.send(UiCommand::Shutdown).await;
        }
    });

    println!("hark ready ({}). Type a message, or /start, /stop, /cancel, /mode <m>, /new, /quit", config.mode);
    daemon.run().await?;
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut mic = MicrophoneStream::open().await?;
    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    let frames_per_second = SAMPLE_RATE as usize / hark::voice::FRAME_SAMPLES;
    for i in 0..duration {
        let mut second = Vec::with_capacity(SAMPLE_RATE as usize);
        while second.len() < frames_per_second * hark::voice::FRAME_SAMPLES {
            match mic.next_frame().await? {
                Some(frame) => second.extend_from_slice(&frame),
                None => anyhow::bail!("microphone stream ended"),
            }
        }

        let energy = calculate_energy(&second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check that the right input device is the default.");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut samples = sine_tone(440.0, Duration::from_secs(2), SAMPLE_RATE);
    apply_volume(&mut samples, 0.3);

    println!("Playing {} samples at {SAMPLE_RATE} Hz...", samples.len());
    DevicePlayback::new()
        .play(samples, SAMPLE_RATE, CancellationToken::new())
        .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}

/// Synthesize and play a phrase with the configured voice
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    let key = match config.tts.provider {
        TtsProvider::OpenAi => config.api_keys.openai.clone(),
        TtsProvider::ElevenLabs => config.api_keys.elevenlabs.clone(),
    }
    .ok_or_else(|| anyhow::anyhow!("no API key configured for the TTS provider"))?;

    let tts = TextToSpeech::new(config.tts.provider, key, config.tts.model.clone())?;
    let params = VoiceParams {
        voice: config.tts.voice.clone(),
        speed: config.tts.speed,
    };

    println!("Synthesizing speech...");
    let audio = tts.synthesize(text, &params).await?;
    println!("Got {} samples at {} Hz", audio.samples.len(), audio.sample_rate);

    let mut samples = audio.samples;
    apply_volume(&mut samples, config.tts.volume);
    println!("Playing audio...");
    DevicePlayback::new()
        .play(samples, audio.sample_rate, CancellationToken::new())
        .await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Validate every tool body against the granted capabilities
fn check_tools() -> anyhow::Result<()> {
    let config = Config::load()?;
    if config.tools.is_empty() {
        println!("No tools configured.");
        return Ok(());
    }

    let executor = SecureExecutor::from_config(config.tools.clone(), &config.sandbox);
    let failures = executor.check_all();

    println!(
        "{} tool(s), sandbox tier {:?}, capabilities: {}",
        config.tools.len(),
        executor.tier(),
        config
            .sandbox
            .capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    for tool in executor.definitions() {
        match failures.iter().find(|(name, _)| *name == tool.name) {
            Some((_, e)) => println!("  FAIL {}: {e}", tool.name),
            None => println!("  ok   {}", tool.name),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} tool(s) would be refused", failures.len())
    }
}

/// List chats, or print one chat
fn history(show: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = config.database_path();
    if !path.exists() {
        println!("No history yet.");
        return Ok(());
    }
    let store = SqliteHistory::new(db::init(&path)?);

    if let Some(chat_id) = show {
        let messages = store.messages(chat_id)?;
        if messages.is_empty() {
            anyhow::bail!("no chat with id {chat_id}");
        }
        for message in messages {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%Y-%m-%d %H:%M:%S"),
                message.role.as_str(),
                message.content
            );
        }
        return Ok(());
    }

    let chats = store.list_chats(limit)?;
    if chats.is_empty() {
        println!("No history yet.");
    }
    for chat in chats {
        println!(
            "{}  {}  {:>3} msgs  {}",
            chat.id,
            chat.updated_at.format("%Y-%m-%d %H:%M"),
            chat.message_count,
            if chat.title.is_empty() { "(untitled)" } else { &chat.title }
        );
    }
    Ok(())
}

/// Child side of the process sandbox tier
///
/// The request arrives as one JSON line. The parent keeps stdin open and
/// closes it when it gives up on the call.
fn sandbox_exec() -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    let cancel = CancellationToken::new();
    let abandoned = cancel.clone();
    std::thread::spawn(move || {
        let _ = std::io::copy(&mut std::io::stdin(), &mut std::io::sink());
        tracing::debug!("parent closed stdin, stopping");
        abandoned.cancel();
    });

    let reply = match serde_json::from_str::<SandboxRequest>(&input) {
        Ok(request) => run_request(&request, &DesktopHost::with_cancel(cancel)),
        Err(e) => ToolReply::from(Err::<serde_json::Value, _>(hark::Error::InvalidArguments(format!(
            "malformed sandbox request: {e}"
        )))),
    };

    println!("{}", serde_json::to_string(&reply)?);
    Ok(())
}
