//! Error types for Hark

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for Hark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a transcription attempt was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionFailure {
    /// Connection failure or timeout
    Network,
    /// Credential rejected
    Auth,
    /// Provider throttled the request
    RateLimit,
    /// Engine could not load or run its model
    Model,
    /// Audio buffer was empty or undecodable
    Input,
    /// Local engine ran out of memory or accelerator capacity
    Resource,
}

impl TranscriptionFailure {
    /// Stable identifier surfaced to the UI and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Model => "model",
            Self::Input => "input",
            Self::Resource => "resource",
        }
    }
}

impl fmt::Display for TranscriptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in Hark
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-fatal configuration problem (e.g. wake word disabled)
    #[error("configuration warning: {0}")]
    ConfigurationWarning(String),

    /// Microphone or speaker unavailable
    #[error("device error: {0}")]
    Device(String),

    /// Audio encoding/decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Transcription abandoned after fallback and retries
    #[error("transcription failed ({reason}): {detail}")]
    Transcription {
        reason: TranscriptionFailure,
        detail: String,
    },

    /// Model connection dropped mid-generation
    #[error("stream error: {0}")]
    Stream(String),

    /// Tool body uses a construct or capability it was not granted
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    /// Tool arguments do not match the parameter schema
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Tool loading or execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Operation exceeded its time budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Shorthand for a transcription error
    pub fn transcription(reason: TranscriptionFailure, detail: impl Into<String>) -> Self {
        Self::Transcription {
            reason,
            detail: detail.into(),
        }
    }

    /// Whether retrying the same attempt later can succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Device(_)
            | Self::Stream(_)
            | Self::Http(_)
            | Self::WebSocket(_)
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::ConfigurationWarning(_) => true,
            Self::Transcription { reason, .. } => matches!(
                reason,
                TranscriptionFailure::Network
                    | TranscriptionFailure::RateLimit
                    | TranscriptionFailure::Resource
            ),
            _ => false,
        }
    }

    /// Human-readable reason relayed to the UI
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Device(detail) => format!("Audio device unavailable: {detail}"),
            Self::Transcription { reason, .. } => match reason {
                TranscriptionFailure::Network => {
                    "Couldn't reach the transcription service".to_string()
                }
                TranscriptionFailure::Auth => "Transcription credentials were rejected".to_string(),
                TranscriptionFailure::RateLimit => {
                    "Transcription service is rate limiting requests".to_string()
                }
                TranscriptionFailure::Model => "Speech model failed to run".to_string(),
                TranscriptionFailure::Input => "Didn't catch that audio".to_string(),
                TranscriptionFailure::Resource => {
                    "Not enough memory to transcribe locally".to_string()
                }
            },
            Self::Stream(detail) => format!("Connection to the model dropped: {detail}"),
            Self::Tts(detail) => format!("Couldn't speak the reply: {detail}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_strings() {
        assert_eq!(TranscriptionFailure::Network.to_string(), "network");
        assert_eq!(TranscriptionFailure::RateLimit.as_str(), "rate_limit");

        let err = Error::transcription(TranscriptionFailure::Network, "timed out");
        assert_eq!(err.to_string(), "transcription failed (network): timed out");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Device("busy".into()).is_recoverable());
        assert!(Error::Stream("eof".into()).is_recoverable());
        assert!(!Error::SandboxViolation("process".into()).is_recoverable());
        assert!(!Error::transcription(TranscriptionFailure::Auth, "401").is_recoverable());
    }

    #[test]
    fn test_user_message_hides_detail_for_transcription() {
        let err = Error::transcription(TranscriptionFailure::Network, "dns lookup failed");
        assert_eq!(err.user_message(), "Couldn't reach the transcription service");
    }
}
