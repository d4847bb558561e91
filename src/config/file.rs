//! TOML configuration file loading
//!
//! Supports `~/.config/hark/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HarkConfigFile {
    /// Interaction mode ("stream", "realtime-basic", "realtime-advanced")
    pub mode: Option<String>,

    /// Number of most recent messages sent to the model
    pub context_window: Option<usize>,

    /// Data directory override (database lives here)
    pub data_dir: Option<String>,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Microphone segmentation and listening policy
    #[serde(default)]
    pub listening: ListeningFileConfig,

    /// Speech-to-text configuration
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech configuration
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Wake word and hotkey configuration
    #[serde(default)]
    pub trigger: TriggerFileConfig,

    /// Tool sandbox configuration
    #[serde(default)]
    pub sandbox: SandboxFileConfig,

    /// User-defined tools
    #[serde(default)]
    pub tools: ToolsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Chat completions model (e.g. "gpt-4o")
    pub model: Option<String>,
    pub temperature: Option<f32>,
    /// Chat completions base URL
    pub base_url: Option<String>,
    /// Realtime model (e.g. "gpt-4o-realtime-preview")
    pub realtime_model: Option<String>,
    /// Realtime WebSocket endpoint
    pub realtime_url: Option<String>,
    pub realtime_voice: Option<String>,
    pub realtime_temperature: Option<f32>,
    /// System instructions sent with every session
    pub instructions: Option<String>,
    /// Upper bound on tool-call rounds per turn
    pub max_tool_rounds: Option<usize>,
}

/// Listening policy configuration
#[derive(Debug, Default, Deserialize)]
pub struct ListeningFileConfig {
    /// RMS threshold above which a frame counts as speech
    pub vad_threshold: Option<f32>,
    /// Silence gap that finalizes an utterance
    pub silence_ms: Option<u64>,
    /// How long to wait for speech onset before giving up
    pub max_wait_ms: Option<u64>,
    /// Hard cap on a single utterance
    pub max_utterance_ms: Option<u64>,
    pub stop_phrase: Option<String>,
    pub extend_phrase: Option<String>,
    /// Start every listening session in extended mode
    pub extended: Option<bool>,
    /// Start and stop cues
    pub chimes: Option<bool>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Preferred source ("local" or "cloud")
    pub source: Option<String>,
    /// Local whisper-compatible inference endpoint
    pub local_url: Option<String>,
    /// Cloud provider ("whisper" or "deepgram")
    pub cloud_provider: Option<String>,
    /// Cloud model (e.g. "whisper-1", "nova-2")
    pub model: Option<String>,
    pub cloud_retries: Option<u32>,
    pub retry_base_ms: Option<u64>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub enabled: Option<bool>,
    /// Provider ("openai" or "elevenlabs")
    pub provider: Option<String>,
    /// TTS model (e.g. "tts-1")
    pub model: Option<String>,
    /// Voice identifier (e.g. "alloy")
    pub voice: Option<String>,
    /// Speed multiplier
    pub speed: Option<f32>,
    /// Output volume between 0.0 and 1.0
    pub volume: Option<f32>,
}

/// Trigger configuration
#[derive(Debug, Default, Deserialize)]
pub struct TriggerFileConfig {
    pub wake_word_enabled: Option<bool>,
    pub wake_words: Option<Vec<String>>,
    /// Start hotkey (e.g. "Shift+Meta+Space")
    pub hotkey_start: Option<String>,
    /// Stop hotkey (e.g. "Escape")
    pub hotkey_stop: Option<String>,
}

/// Sandbox configuration
#[derive(Debug, Default, Deserialize)]
pub struct SandboxFileConfig {
    /// Isolation tier ("in_process" or "process")
    pub tier: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Granted capability names
    pub capabilities: Option<Vec<String>>,
}

/// Tool definitions source
#[derive(Debug, Default, Deserialize)]
pub struct ToolsFileConfig {
    /// Inline JSON array of function definitions
    pub functions_json: Option<String>,
    /// Path to a JSON file holding the function definitions
    pub functions_path: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
    pub wake_word: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `HarkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HarkConfigFile {
    let Some(path) = config_file_path() else {
        return HarkConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> HarkConfigFile {
    if !path.exists() {
        return HarkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HarkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HarkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/hark/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hark").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let content = r#"
            mode = "realtime-basic"
            context_window = 6

            [tts]
            voice = "nova"
            volume = 0.5

            [sandbox]
            capabilities = ["clipboard", "log"]
        "#;

        let fc: HarkConfigFile = toml::from_str(content).unwrap();
        assert_eq!(fc.mode.as_deref(), Some("realtime-basic"));
        assert_eq!(fc.context_window, Some(6));
        assert_eq!(fc.tts.voice.as_deref(), Some("nova"));
        assert_eq!(fc.sandbox.capabilities.unwrap().len(), 2);
        assert!(fc.stt.source.is_none());
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mode = [not valid").unwrap();

        let fc = load_config_file_from(&path);
        assert!(fc.mode.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let fc = load_config_file_from(Path::new("/nonexistent/hark/config.toml"));
        assert!(fc.llm.model.is_none());
    }
}
