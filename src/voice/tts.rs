//! Text-to-speech (TTS) synthesis

use std::str::FromStr;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::playback::decode_mp3;
use crate::{Error, Result};

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAi,
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" | "eleven_labs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Decoded speech ready for playback
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Voice parameters for one synthesis request
#[derive(Debug, Clone)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
}

/// Text-to-speech backend
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the given voice
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<SynthesizedAudio>;
}

/// Synthesizes speech through a cloud provider
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: TtsProvider,
    base_url: String,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: SecretString, model: String) -> Result<Self> {
        Self::new(TtsProvider::OpenAi, api_key, model)
    }

    /// Create a new TTS instance using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: SecretString, model: String) -> Result<Self> {
        Self::new(TtsProvider::ElevenLabs, api_key, model)
    }

    /// Create a TTS instance for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty
    pub fn new(provider: TtsProvider, api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("{provider:?} API key required for TTS")));
        }

        let base_url = match provider {
            TtsProvider::OpenAi => "https://api.openai.com/v1",
            TtsProvider::ElevenLabs => "https://api.elevenlabs.io/v1",
        };

        Ok(Self {
            client: reqwest::Client::new(),
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

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str, params: &VoiceParams) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &params.voice,
            speed: params.speed,
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str, params: &VoiceParams) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{}/text-to-speech/{}", self.base_url, params.voice);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<SynthesizedAudio> {
        let mp3 = match self.provider {
            TtsProvider::OpenAi => self.synthesize_openai(text, params).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, params).await?,
        };

        let (samples, sample_rate) = decode_mp3(&mp3).map_err(|e| Error::Tts(e.to_string()))?;
        tracing::debug!(
            provider = ?self.provider,
            samples = samples.len(),
            sample_rate,
            "speech synthesized"
        );

        Ok(SynthesizedAudio {
            samples,
            sample_rate,
        })
    }
}
