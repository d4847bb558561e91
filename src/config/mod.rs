//! Configuration management for Hark
//!
//! Values resolve as environment > TOML file > built-in defaults. Secrets are
//! wrapped in [`SecretString`] as soon as they are read and are only exposed
//! at the point where a request header is built.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::session::Mode;
use crate::tools::{Capability, CapabilitySet, SandboxTier, ToolDefinition};
use crate::transcription::{CloudProvider, SttSource};
use crate::voice::TtsProvider;
use crate::{Error, Result};

use file::HarkConfigFile;

/// Hark configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active interaction mode
    pub mode: Mode,

    /// Number of most recent messages sent to the model
    pub context_window: usize,

    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// Language model configuration
    pub llm: LlmConfig,

    /// Listening policy
    pub listening: ListeningConfig,

    /// Speech-to-text configuration
    pub stt: SttConfig,

    /// Text-to-speech configuration
    pub tts: TtsConfig,

    /// Wake word and hotkey configuration
    pub trigger: TriggerConfig,

    /// Tool sandbox configuration
    pub sandbox: SandboxConfig,

    /// User-defined tools offered to the model
    pub tools: Vec<ToolDefinition>,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub base_url: String,
    pub realtime_model: String,
    pub realtime_url: String,
    pub realtime_voice: String,
    pub realtime_temperature: f32,
    pub instructions: String,
    pub max_tool_rounds: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            base_url: "https://api.openai.com/v1".to_string(),
            realtime_model: "gpt-4o-realtime-preview".to_string(),
            realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            realtime_voice: "alloy".to_string(),
            realtime_temperature: 0.8,
            instructions: String::new(),
            max_tool_rounds: 8,
        }
    }
}

/// Listening policy configuration
#[derive(Debug, Clone)]
pub struct ListeningConfig {
    /// RMS threshold above which a frame counts as speech
    pub vad_threshold: f32,
    /// Silence gap that finalizes an utterance
    pub silence: Duration,
    /// No-speech window in single-shot mode
    pub max_wait: Duration,
    /// No-speech window in extended mode
    pub extended_max_wait: Duration,
    /// Hard cap on a single utterance
    pub max_utterance: Duration,
    pub stop_phrase: String,
    pub extend_phrase: String,
    /// Start every listening session in extended mode
    pub extended: bool,
    /// Play cues when a listening session opens and closes
    pub chimes: bool,
}

impl Default for ListeningConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.015,
            silence: Duration::from_millis(800),
            max_wait: Duration::from_secs(10),
            extended_max_wait: Duration::from_secs(6),
            max_utterance: Duration::from_secs(30),
            stop_phrase: "stop listening".to_string(),
            extend_phrase: "keep listening".to_string(),
            extended: false,
            chimes: true,
        }
    }
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub source: SttSource,
    pub local_url: String,
    pub cloud_provider: CloudProvider,
    pub model: String,
    pub cloud_retries: u32,
    pub retry_base: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            source: SttSource::Local,
            local_url: "http://127.0.0.1:8178/inference".to_string(),
            cloud_provider: CloudProvider::Whisper,
            model: "whisper-1".to_string(),
            cloud_retries: 2,
            retry_base: Duration::from_secs(1),
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub enabled: bool,
    pub provider: TtsProvider,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    /// Output volume between 0.0 and 1.0
    pub volume: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: TtsProvider::OpenAi,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            volume: 1.0,
        }
    }
}

/// Trigger configuration
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub wake_word_enabled: bool,
    pub wake_words: Vec<String>,
    pub hotkey_start: String,
    pub hotkey_stop: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            wake_word_enabled: false,
            wake_words: vec!["hey hark".to_string()],
            hotkey_start: "Shift+Meta+Space".to_string(),
            hotkey_stop: "Escape".to_string(),
        }
    }
}

/// Tool sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub tier: SandboxTier,
    pub timeout: Duration,
    pub capabilities: CapabilitySet,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tier: SandboxTier::InProcess,
            timeout: Duration::from_secs(10),
            capabilities: CapabilitySet::desktop_default(),
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<SecretString>,
    pub deepgram: Option<SecretString>,
    pub elevenlabs: Option<SecretString>,
    pub wake_word: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Stream,
            context_window: 10,
            data_dir: default_data_dir(),
            llm: LlmConfig::default(),
            listening: ListeningConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            trigger: TriggerConfig::default(),
            sandbox: SandboxConfig::default(),
            tools: Vec::new(),
            api_keys: ApiKeys::default(),
        }
    }
}

/// Default data directory: `~/.local/share/hark` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(|| PathBuf::from(".hark"), |d| d.data_dir().join("hark"))
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or tool definitions are invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(fc, |key| std::env::var(key).ok())?;

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Resolve a configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or tool definitions are invalid
    #[allow(clippy::too_many_lines)]
    pub fn resolve(fc: HarkConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let mode = pick(env("HARK_MODE"), fc.mode)
            .map(|s| parse_field::<Mode>("mode", &s))
            .transpose()?
            .unwrap_or(defaults.mode);

        let context_window = env("HARK_CONTEXT_WINDOW")
            .and_then(|s| s.parse().ok())
            .or(fc.context_window)
            .unwrap_or(defaults.context_window);
        if context_window == 0 {
            return Err(Error::Config("context_window must be at least 1".to_string()));
        }

        let data_dir = pick(env("HARK_DATA_DIR"), fc.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);

        let llm = {
            let d = LlmConfig::default();
            let f = fc.llm;
            LlmConfig {
                model: pick(env("HARK_LLM_MODEL"), f.model).unwrap_or(d.model),
                temperature: f.temperature.unwrap_or(d.temperature),
                base_url: pick(env("HARK_LLM_BASE_URL"), f.base_url).unwrap_or(d.base_url),
                realtime_model: f.realtime_model.unwrap_or(d.realtime_model),
                realtime_url: pick(env("HARK_REALTIME_URL"), f.realtime_url)
                    .unwrap_or(d.realtime_url),
                realtime_voice: f.realtime_voice.unwrap_or(d.realtime_voice),
                realtime_temperature: f.realtime_temperature.unwrap_or(d.realtime_temperature),
                instructions: f.instructions.unwrap_or(d.instructions),
                max_tool_rounds: f.max_tool_rounds.unwrap_or(d.max_tool_rounds).max(1),
            }
        };

        let listening = {
            let d = ListeningConfig::default();
            let f = fc.listening;
            ListeningConfig {
                vad_threshold: f.vad_threshold.unwrap_or(d.vad_threshold),
                silence: f.silence_ms.map_or(d.silence, Duration::from_millis),
                max_wait: f.max_wait_ms.map_or(d.max_wait, Duration::from_millis),
                extended_max_wait: d.extended_max_wait,
                max_utterance: f.max_utterance_ms.map_or(d.max_utterance, Duration::from_millis),
                stop_phrase: f.stop_phrase.unwrap_or(d.stop_phrase),
                extend_phrase: f.extend_phrase.unwrap_or(d.extend_phrase),
                extended: f.extended.unwrap_or(d.extended),
                chimes: f.chimes.unwrap_or(d.chimes),
            }
        };

        let stt = {
            let d = SttConfig::default();
            let f = fc.stt;
            SttConfig {
                source: pick(env("HARK_STT_SOURCE"), f.source)
                    .map(|s| parse_field::<SttSource>("stt.source", &s))
                    .transpose()?
                    .unwrap_or(d.source),
                local_url: pick(env("HARK_STT_LOCAL_URL"), f.local_url).unwrap_or(d.local_url),
                cloud_provider: f
                    .cloud_provider
                    .map(|s| parse_field::<CloudProvider>("stt.cloud_provider", &s))
                    .transpose()?
                    .unwrap_or(d.cloud_provider),
                model: pick(env("HARK_STT_MODEL"), f.model).unwrap_or(d.model),
                cloud_retries: f.cloud_retries.unwrap_or(d.cloud_retries),
                retry_base: f.retry_base_ms.map_or(d.retry_base, Duration::from_millis),
            }
        };

        let tts = {
            let d = TtsConfig::default();
            let f = fc.tts;
            TtsConfig {
                enabled: f.enabled.unwrap_or(d.enabled),
                provider: f
                    .provider
                    .map(|s| parse_field::<TtsProvider>("tts.provider", &s))
                    .transpose()?
                    .unwrap_or(d.provider),
                model: pick(env("HARK_TTS_MODEL"), f.model).unwrap_or(d.model),
                voice: pick(env("HARK_TTS_VOICE"), f.voice).unwrap_or(d.voice),
                speed: f.speed.unwrap_or(d.speed),
                volume: f.volume.unwrap_or(d.volume).clamp(0.0, 1.0),
            }
        };

        let trigger = {
            let d = TriggerConfig::default();
            let f = fc.trigger;
            TriggerConfig {
                wake_word_enabled: f.wake_word_enabled.unwrap_or(d.wake_word_enabled),
                wake_words: f.wake_words.unwrap_or(d.wake_words),
                hotkey_start: f.hotkey_start.unwrap_or(d.hotkey_start),
                hotkey_stop: f.hotkey_stop.unwrap_or(d.hotkey_stop),
            }
        };

        let sandbox = {
            let d = SandboxConfig::default();
            let f = fc.sandbox;
            let capabilities = match f.capabilities {
                Some(names) => names
                    .iter()
                    .map(|n| parse_field::<Capability>("sandbox.capabilities", n))
                    .collect::<Result<CapabilitySet>>()?,
                None => d.capabilities,
            };
            SandboxConfig {
                tier: pick(env("HARK_SANDBOX_TIER"), f.tier)
                    .map(|s| parse_field::<SandboxTier>("sandbox.tier", &s))
                    .transpose()?
                    .unwrap_or(d.tier),
                timeout: f.timeout_ms.map_or(d.timeout, Duration::from_millis),
                capabilities,
            }
        };

        let tools = match (fc.tools.functions_json, fc.tools.functions_path) {
            (Some(json), _) => ToolDefinition::parse_list(&json)?,
            (None, Some(path)) => {
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("failed to read functions file {path}: {e}"))
                })?;
                ToolDefinition::parse_list(&json)?
            }
            (None, None) => Vec::new(),
        };

        let api_keys = ApiKeys {
            openai: secret(env("OPENAI_API_KEY"), fc.api_keys.openai),
            deepgram: secret(env("DEEPGRAM_API_KEY"), fc.api_keys.deepgram),
            elevenlabs: secret(env("ELEVENLABS_API_KEY"), fc.api_keys.elevenlabs),
            wake_word: secret(env("HARK_WAKE_WORD_KEY"), fc.api_keys.wake_word),
        };

        Ok(Self {
            mode,
            context_window,
            data_dir,
            llm,
            listening,
            stt,
            tts,
            trigger,
            sandbox,
            tools,
            api_keys,
        })
    }

    /// Path of the history database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("hark.db")
    }
}

/// First non-empty value, environment winning over file
fn pick(env: Option<String>, file: Option<String>) -> Option<String> {
    env.filter(|s| !s.is_empty()).or(file)
}

fn secret(env: Option<String>, file: Option<String>) -> Option<SecretString> {
    pick(env, file)
        .filter(|s| !s.trim().is_empty())
        .map(SecretString::from)
}

fn parse_field<T: FromStr<Err = Error>>(field: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e: Error| Error::Config(format!("{field}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(HarkConfigFile::default(), env_from(&[])).unwrap();

        assert_eq!(config.mode, Mode::Stream);
        assert_eq!(config.context_window, 10);
        assert_eq!(config.sandbox.timeout, Duration::from_secs(10));
        assert_eq!(config.stt.cloud_retries, 2);
        assert_eq!(config.trigger.hotkey_start, "Shift+Meta+Space");
        assert!(config.sandbox.capabilities.contains(Capability::Clipboard));
        assert!(!config.sandbox.capabilities.contains(Capability::Process));
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: HarkConfigFile = toml::from_str(
            r#"
            mode = "realtime-basic"
            [api_keys]
            openai = "from-file"
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            env_from(&[("HARK_MODE", "realtime-advanced"), ("OPENAI_API_KEY", "from-env")]),
        )
        .unwrap();

        assert_eq!(config.mode, Mode::RealtimeAdvanced);
        assert_eq!(
            config.api_keys.openai.as_ref().unwrap().expose_secret(),
            "from-env"
        );
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let result = Config::resolve(HarkConfigFile::default(), env_from(&[("HARK_MODE", "turbo")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let fc: HarkConfigFile = toml::from_str(
            r#"
            [sandbox]
            capabilities = ["clipboard", "teleport"]
            "#,
        )
        .unwrap();

        assert!(Config::resolve(fc, env_from(&[])).is_err());
    }

    #[test]
    fn test_inline_functions_loaded() {
        let fc: HarkConfigFile = toml::from_str(
            r#"
            [tools]
            functions_json = '[{"name": "save_note", "description": "Save a note", "action": "return args.text"}]'
            "#,
        )
        .unwrap();

        let config = Config::resolve(fc, env_from(&[])).unwrap();
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.tools[0].name, "save_note");
    }

    #[test]
    fn test_volume_clamped() {
        let fc: HarkConfigFile = toml::from_str("[tts]\nvolume = 3.5").unwrap();
        let config = Config::resolve(fc, env_from(&[])).unwrap();
        assert!((config.tts.volume - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_chimes_on_unless_disabled() {
        let config = Config::resolve(HarkConfigFile::default(), env_from(&[])).unwrap();
        assert!(config.listening.chimes);

        let fc: HarkConfigFile = toml::from_str("[listening]\nchimes = false").unwrap();
        let config = Config::resolve(fc, env_from(&[])).unwrap();
        assert!(!config.listening.chimes);
    }
}
