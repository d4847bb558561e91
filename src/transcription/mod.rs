//! Speech-to-text with local-first policy and cloud fallback
//!
//! Local inference is tried first. A resource-exhaustion failure triggers a
//! single cloud attempt for the same buffer and flips the process-wide
//! default to cloud. Any other local failure is surfaced as-is. Cloud calls
//! are retried with exponential backoff on network, auth and rate-limit
//! failures.

mod cloud;
mod engine;
mod local;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

pub use cloud::CloudSpeechEngine;
pub use engine::{
    EngineTranscript, SpeechEngine, classify_cloud_status, classify_local_failure,
    classify_request_error,
};
pub use local::LocalWhisperEngine;

use crate::config::{ApiKeys, SttConfig};
use crate::error::TranscriptionFailure;
use crate::voice::{Utterance, samples_to_wav};
use crate::{Error, Result};

/// Which engine produced a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttSource {
    Local,
    Cloud,
}

impl fmt::Display for SttSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        })
    }
}

impl FromStr for SttSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(Error::Config(format!("unknown STT source: {other}"))),
        }
    }
}

/// Hosted transcription provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Whisper,
    Deepgram,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Whisper => "whisper",
            Self::Deepgram => "deepgram",
        })
    }
}

impl FromStr for CloudProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown cloud STT provider: {other}"))),
        }
    }
}

/// Outcome of transcribing one utterance
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Trimmed transcript; empty means silence was misclassified as speech
    pub text: String,
    pub source: SttSource,
    pub latency: Duration,
    /// Engine calls made, fallback and retries included
    pub attempts: u32,
    pub confidence: Option<f32>,
}

impl TranscriptionResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Backoff for cloud retries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Local-first transcription with cloud fallback
pub struct TranscriptionService {
    local: Option<Arc<dyn SpeechEngine>>,
    cloud: Option<Arc<dyn SpeechEngine>>,
    prefer_cloud: AtomicBool,
    retry: RetryPolicy,
}

impl TranscriptionService {
    #[must_use]
    pub fn new(
        local: Option<Arc<dyn SpeechEngine>>,
        cloud: Option<Arc<dyn SpeechEngine>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            prefer_cloud: AtomicBool::new(local.is_none()),
            local,
            cloud,
            retry,
        }
    }

    /// Build engines from configuration
    ///
    /// The cloud engine is only available when its credential is configured.
    ///
    /// # Errors
    ///
    /// Returns error if neither engine can be constructed
    pub fn from_config(stt: &SttConfig, keys: &ApiKeys) -> Result<Self> {
        let local: Option<Arc<dyn SpeechEngine>> = match stt.source {
            SttSource::Local => Some(Arc::new(LocalWhisperEngine::new(stt.local_url.clone())?)),
            SttSource::Cloud => None,
        };

        let key = match stt.cloud_provider {
            CloudProvider::Whisper => keys.openai.clone(),
            CloudProvider::Deepgram => keys.deepgram.clone(),
        };
        let cloud: Option<Arc<dyn SpeechEngine>> = match key {
            Some(key) => Some(Arc::new(CloudSpeechEngine::new(
                stt.cloud_provider,
                key,
                stt.model.clone(),
            )?)),
            None => {
                tracing::warn!(provider = %stt.cloud_provider, "no cloud STT credential, fallback disabled");
                None
            }
        };

        if local.is_none() && cloud.is_none() {
            return Err(Error::Config(
                "cloud transcription selected but no credential configured".to_string(),
            ));
        }

        Ok(Self::new(
            local,
            cloud,
            RetryPolicy {
                max_retries: stt.cloud_retries,
                base_delay: stt.retry_base,
            },
        ))
    }

    /// The source the next utterance will be sent to first
    #[must_use]
    pub fn default_source(&self) -> SttSource {
        if self.prefer_cloud.load(Ordering::Acquire) || self.local.is_none() {
            SttSource::Cloud
        } else {
            SttSource::Local
        }
    }

    /// Transcribe one utterance
    ///
    /// Returns exactly one result or one error per call.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` once fallback and retries are
    /// exhausted, or `Error::Cancelled` if `cancel` fires first
    pub async fn transcribe(
        &self,
        utterance: &Utterance,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionResult> {
        if utterance.samples.is_empty() {
            return Err(Error::transcription(
                TranscriptionFailure::Input,
                "empty audio buffer",
            ));
        }

        let wav = samples_to_wav(&utterance.samples, utterance.sample_rate)
            .map_err(|e| Error::transcription(TranscriptionFailure::Input, e.to_string()))?;
        let started = Instant::now();

        let (transcript, source, attempts) = match (self.default_source(), &self.local) {
            (SttSource::Local, Some(local)) => match attempt(local.as_ref(), &wav, cancel).await {
                Ok(transcript) => (transcript, SttSource::Local, 1),
                Err(Error::Transcription {
                    reason: TranscriptionFailure::Resource,
                    detail,
                }) => {
                    self.prefer_cloud.store(true, Ordering::Release);
                    tracing::warn!(
                        detail = %detail,
                        "local inference out of resources, switching to cloud for this session"
                    );
                    let transcript = attempt(self.cloud_engine()?, &wav, cancel).await?;
                    (transcript, SttSource::Cloud, 2)
                }
                Err(e) => return Err(e),
            },
            _ => {
                let (transcript, attempts) = self.cloud_with_retries(&wav, cancel).await?;
                (transcript, SttSource::Cloud, attempts)
            }
        };

        let result = TranscriptionResult {
            text: transcript.text.trim().to_string(),
            source,
            latency: started.elapsed(),
            attempts,
            confidence: transcript.confidence,
        };

        tracing::info!(
            source = %result.source,
            latency_ms = result.latency.as_millis(),
            attempts = result.attempts,
            chars = result.text.len(),
            "transcription complete"
        );

        Ok(result)
    }

    fn cloud_engine(&self) -> Result<&dyn SpeechEngine> {
        self.cloud.as_deref().ok_or_else(|| {
            Error::transcription(
                TranscriptionFailure::Auth,
                "no cloud transcription credential configured",
            )
        })
    }

    async fn cloud_with_retries(
        &self,
        wav: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(EngineTranscript, u32)> {
        let engine = self.cloud_engine()?;
        let mut retry = 0;

        loop {
            match attempt(engine, wav, cancel).await {
                Ok(transcript) => return Ok((transcript, retry + 1)),
                Err(Error::Transcription { reason, detail })
                    if is_retryable(reason) && retry < self.retry.max_retries =>
                {
                    let delay = self.retry.delay(retry);
                    tracing::warn!(
                        engine = engine.name(),
                        reason = %reason,
                        detail = %detail,
                        retry = retry + 1,
                        delay_ms = delay.as_millis(),
                        "cloud transcription failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

const fn is_retryable(reason: TranscriptionFailure) -> bool {
    matches!(
        reason,
        TranscriptionFailure::Network | TranscriptionFailure::Auth | TranscriptionFailure::RateLimit
    )
}

/// One engine call, cancellable, with errors normalized
async fn attempt(
    engine: &dyn SpeechEngine,
    wav: &[u8],
    cancel: &CancellationToken,
) -> Result<EngineTranscript> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = engine.transcribe(wav) => result.map_err(engine::into_transcription_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_source_parse() {
        assert_eq!("cloud".parse::<SttSource>().unwrap(), SttSource::Cloud);
        assert_eq!("Deepgram".parse::<CloudProvider>().unwrap(), CloudProvider::Deepgram);
        assert!("gpu".parse::<SttSource>().is_err());
    }

    #[test]
    fn test_cloud_only_service_defaults_to_cloud() {
        let service = TranscriptionService::new(None, None, RetryPolicy::default());
        assert_eq!(service.default_source(), SttSource::Cloud);
    }

    #[test]
    fn test_retryable_reasons() {
        assert!(is_retryable(TranscriptionFailure::Network));
        assert!(is_retryable(TranscriptionFailure::RateLimit));
        assert!(!is_retryable(TranscriptionFailure::Input));
        assert!(!is_retryable(TranscriptionFailure::Resource));
    }
}
