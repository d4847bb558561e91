//! Cloud speech-to-text (OpenAI Whisper, Deepgram)

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::engine::{EngineTranscript, SpeechEngine, classify_cloud_status, classify_request_error};
use super::CloudProvider;
use crate::error::TranscriptionFailure;
use crate::{Error, Result};

/// Per-request timeout for cloud calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Transcribes speech through a hosted provider
pub struct CloudSpeechEngine {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: CloudProvider,
    base_url: String,
}

impl CloudSpeechEngine {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: SecretString, model: String) -> Result<Self> {
        Self::new(CloudProvider::Whisper, api_key, model)
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: SecretString, model: String) -> Result<Self> {
        Self::new(CloudProvider::Deepgram, api_key, model)
    }

    /// Create an engine for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty or the client cannot be built
    pub fn new(provider: CloudProvider, api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("{provider} API key required")));
        }

        let base_url = match provider {
            CloudProvider::Whisper => "https://api.openai.com/v1",
            CloudProvider::Deepgram => "https://api.deepgram.com/v1",
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            provider,
            base_url: base_url.to_string(),
        })
    }

    /// Point at a different API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: &[u8]) -> Result<EngineTranscript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::transcription(TranscriptionFailure::Input, e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Whisper API error");
            return Err(Error::transcription(
                classify_cloud_status(status),
                format!("Whisper API error {status}: {body}"),
            ));
        }

        let result: WhisperResponse = response.json().await.map_err(request_failed)?;
        Ok(EngineTranscript::new(result.text.trim()))
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8]) -> Result<EngineTranscript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "{}/listen?model={}&punctuate=true",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key.expose_secret()))
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::transcription(
                classify_cloud_status(status),
                format!("Deepgram API error {status}: {body}"),
            ));
        }

        let result: DeepgramResponse = response.json().await.map_err(request_failed)?;

        let best = result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next());

        Ok(best.map_or_else(
            || EngineTranscript::new(""),
            |a| EngineTranscript {
                text: a.transcript.trim().to_string(),
                confidence: a.confidence,
            },
        ))
    }
}

fn request_failed(e: reqwest::Error) -> Error {
    tracing::debug!(error = %e, "cloud transcription request failed");
    Error::transcription(classify_request_error(&e), e.to_string())
}

#[async_trait]
impl SpeechEngine for CloudSpeechEngine {
    fn name(&self) -> &str {
        match self.provider {
            CloudProvider::Whisper => "whisper",
            CloudProvider::Deepgram => "deepgram",
        }
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<EngineTranscript> {
        match self.provider {
            CloudProvider::Whisper => self.transcribe_whisper(wav).await,
            CloudProvider::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deepgram_response_parses_confidence() {
        let json = r#"{"results":{"channels":[{"alternatives":[{"transcript":"buy oat milk","confidence":0.93}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(json).unwrap();
        let alt = &parsed.results.channels[0].alternatives[0];
        assert_eq!(alt.transcript, "buy oat milk");
        assert_eq!(alt.confidence, Some(0.93));
    }

    #[test]
    fn test_empty_key_rejected() {
        let result = CloudSpeechEngine::new_whisper(SecretString::from(String::new()), "whisper-1".into());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_failure() {
        let engine = CloudSpeechEngine::new_whisper(SecretString::from("sk-test".to_string()), "whisper-1".into())
            .unwrap()
            .with_base_url("http://127.0.0.1:9");

        let err = engine.transcribe(b"RIFF").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transcription {
                reason: TranscriptionFailure::Network,
                ..
            }
        ));
    }
}
