//! Local whisper inference server client

use std::time::Duration;

use async_trait::async_trait;

use super::engine::{EngineTranscript, SpeechEngine, classify_local_failure};
use crate::error::TranscriptionFailure;
use crate::{Error, Result};

/// Local inference can be slow on CPU; still bound it
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(serde::Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    error: Option<String>,
}

/// Transcribes through a whisper.cpp-compatible server on this machine
pub struct LocalWhisperEngine {
    client: reqwest::Client,
    url: String,
}

impl LocalWhisperEngine {
    /// Create a client for the server at `url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SpeechEngine for LocalWhisperEngine {
    fn name(&self) -> &str {
        "local-whisper"
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<EngineTranscript> {
        tracing::debug!(audio_bytes = wav.len(), url = %self.url, "starting local transcription");

        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::transcription(TranscriptionFailure::Input, e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("response_format", "json")
            .text("temperature", "0.0");

        // An unreachable local server means the engine is not running
        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::transcription(TranscriptionFailure::Model, e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let reason = classify_local_failure(status, &body);
            tracing::warn!(status = %status, reason = %reason, "local inference failed");
            return Err(Error::transcription(
                reason,
                format!("local inference error {status}: {body}"),
            ));
        }

        let parsed: InferenceResponse = serde_json::from_str(&body)
            .map_err(|e| Error::transcription(TranscriptionFailure::Model, e.to_string()))?;

        // whisper.cpp reports some failures with a 200 and an error field
        if let Some(error) = parsed.error {
            let reason = classify_local_failure(status, &error);
            return Err(Error::transcription(reason, error));
        }

        Ok(EngineTranscript::new(parsed.text.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_response_variants() {
        let ok: InferenceResponse = serde_json::from_str(r#"{"text":" hello "}"#).unwrap();
        assert_eq!(ok.text, " hello ");
        assert!(ok.error.is_none());

        let err: InferenceResponse =
            serde_json::from_str(r#"{"error":"insufficient memory for model"}"#).unwrap();
        assert!(err.text.is_empty());
        assert_eq!(
            classify_local_failure(reqwest::StatusCode::OK, &err.error.unwrap()),
            TranscriptionFailure::Resource
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_model_failure() {
        let engine = LocalWhisperEngine::new("http://127.0.0.1:9/inference").unwrap();
        let err = engine.transcribe(b"RIFF").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transcription {
                reason: TranscriptionFailure::Model,
                ..
            }
        ));
    }
}
