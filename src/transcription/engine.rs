//! Speech engine contract and failure classification

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::TranscriptionFailure;
use crate::{Error, Result};

/// Text produced by a single engine call
#[derive(Debug, Clone, PartialEq)]
pub struct EngineTranscript {
    pub text: String,
    pub confidence: Option<f32>,
}

impl EngineTranscript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// A speech-to-text engine
///
/// Implementations report failures as `Error::Transcription` so the service
/// can decide between fallback, retry and surfacing.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Transcribe a 16-bit mono WAV buffer
    async fn transcribe(&self, wav: &[u8]) -> Result<EngineTranscript>;
}

/// Classify an HTTP status from a cloud provider
#[must_use]
pub fn classify_cloud_status(status: StatusCode) -> TranscriptionFailure {
    match status.as_u16() {
        401 | 403 => TranscriptionFailure::Auth,
        429 => TranscriptionFailure::RateLimit,
        408 => TranscriptionFailure::Network,
        400 | 413 | 415 | 422 => TranscriptionFailure::Input,
        s if s >= 500 => TranscriptionFailure::Network,
        _ => TranscriptionFailure::Model,
    }
}

/// Classify a response from the local inference server
#[must_use]
pub fn classify_local_failure(status: StatusCode, body: &str) -> TranscriptionFailure {
    let lowered = body.to_lowercase();
    if matches!(status.as_u16(), 503 | 507)
        || lowered.contains("out of memory")
        || lowered.contains("insufficient")
    {
        return TranscriptionFailure::Resource;
    }
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
        return TranscriptionFailure::Input;
    }
    TranscriptionFailure::Model
}

/// Classify a transport-level request error
#[must_use]
pub fn classify_request_error(e: &reqwest::Error) -> TranscriptionFailure {
    if e.is_decode() || e.is_body() {
        TranscriptionFailure::Model
    } else {
        TranscriptionFailure::Network
    }
}

/// Normalize any error coming out of an engine into the transcription taxonomy
pub(crate) fn into_transcription_error(e: Error) -> Error {
    match e {
        Error::Transcription { .. } | Error::Cancelled => e,
        Error::Http(ref inner) => Error::transcription(classify_request_error(inner), e.to_string()),
        Error::Timeout(_) => Error::transcription(TranscriptionFailure::Network, e.to_string()),
        Error::Audio(_) => Error::transcription(TranscriptionFailure::Input, e.to_string()),
        other => Error::transcription(TranscriptionFailure::Model, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_status_classification() {
        assert_eq!(
            classify_cloud_status(StatusCode::UNAUTHORIZED),
            TranscriptionFailure::Auth
        );
        assert_eq!(
            classify_cloud_status(StatusCode::TOO_MANY_REQUESTS),
            TranscriptionFailure::RateLimit
        );
        assert_eq!(
            classify_cloud_status(StatusCode::BAD_GATEWAY),
            TranscriptionFailure::Network
        );
        assert_eq!(
            classify_cloud_status(StatusCode::REQUEST_TIMEOUT),
            TranscriptionFailure::Network
        );
        assert_eq!(
            classify_cloud_status(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            TranscriptionFailure::Input
        );
    }

    #[test]
    fn test_local_resource_classification() {
        assert_eq!(
            classify_local_failure(StatusCode::INSUFFICIENT_STORAGE, ""),
            TranscriptionFailure::Resource
        );
        assert_eq!(
            classify_local_failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ggml: CUDA error: out of memory"
            ),
            TranscriptionFailure::Resource
        );
        assert_eq!(
            classify_local_failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to load model"),
            TranscriptionFailure::Model
        );
    }

    #[test]
    fn test_plain_errors_normalized() {
        let err = into_transcription_error(Error::Timeout(std::time::Duration::from_secs(1)));
        assert!(matches!(
            err,
            Error::Transcription {
                reason: TranscriptionFailure::Network,
                ..
            }
        ));
        assert!(matches!(
            into_transcription_error(Error::Cancelled),
            Error::Cancelled
        ));
    }
}
