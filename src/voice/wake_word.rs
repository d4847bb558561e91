//! Wake word detection
//!
//! Detects wake words in the idle frame stream to activate the assistant.
//! Uses a hybrid approach: local energy detection + transcript verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::capture::{FrameSource, SAMPLE_RATE, samples_to_wav};
use super::vad::calculate_energy;
use crate::transcription::SpeechEngine;
use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum speech before a segment is worth verifying (0.3 s)
const MIN_SPEECH_FRAMES: usize = 15;

/// Silence that closes a candidate segment (0.5 s)
const SILENCE_FRAMES: usize = 25;

/// Longest candidate segment kept for verification (3 s)
const MAX_SEGMENT_FRAMES: usize = 150;

/// State of the wake word detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Detected potential speech, accumulating
    Listening,
}

/// A verified wake phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeDetection {
    /// The configured phrase that matched
    pub keyword_id: String,
    pub at: DateTime<Utc>,
}

/// Detects candidate wake-word segments in audio frames
pub struct WakeWordDetector {
    wake_words: Vec<String>,
    threshold: f32,
    state: DetectorState,
    speech_buffer: Vec<f32>,
    speech_frames: usize,
    silence_frames: usize,
}

impl WakeWordDetector {
    /// Create a new wake word detector
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationWarning` if no usable wake word is configured
    pub fn new(wake_words: Vec<String>) -> Result<Self> {
        let normalized: Vec<String> = wake_words
            .into_iter()
            .map(|w| normalize(&w))
            .filter(|w| !w.is_empty())
            .collect();

        if normalized.is_empty() {
            return Err(Error::ConfigurationWarning(
                "no wake words configured, wake word disabled".to_string(),
            ));
        }

        tracing::debug!(wake_words = ?normalized, "wake word detector initialized");

        Ok(Self {
            wake_words: normalized,
            threshold: ENERGY_THRESHOLD,
            state: DetectorState::Idle,
            speech_buffer: Vec::new(),
            speech_frames: 0,
            silence_frames: 0,
        })
    }

    /// Override the energy gate
    #[must_use]
    pub const fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Process one frame
    ///
    /// Returns true once a candidate segment (speech followed by silence) is
    /// ready for verification
    pub fn process(&mut self, frame: &[f32]) -> bool {
        let energy = calculate_energy(frame);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(frame);
                    self.speech_frames = 1;
                    self.silence_frames = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            DetectorState::Listening => {
                self.speech_buffer.extend_from_slice(frame);

                if is_speech {
                    self.speech_frames += 1;
                    self.silence_frames = 0;
                } else {
                    self.silence_frames += 1;
                }

                if self.silence_frames >= SILENCE_FRAMES {
                    if self.speech_frames >= MIN_SPEECH_FRAMES {
                        tracing::debug!(
                            samples = self.speech_buffer.len(),
                            "candidate segment complete"
                        );
                        return true;
                    }
                    tracing::trace!("too short, resetting");
                    self.reset();
                } else if self.speech_frames + self.silence_frames >= MAX_SEGMENT_FRAMES {
                    tracing::trace!("segment too long for a wake phrase, resetting");
                    self.reset();
                }
            }
        }

        false
    }

    /// Check if transcribed text contains a wake word
    ///
    /// Returns the matching phrase; the detector resets either way
    pub fn check_wake_word(&mut self, transcript: &str) -> Option<String> {
        let normalized = normalize(transcript);
        self.reset();

        let found = self
            .wake_words
            .iter()
            .find(|w| normalized.contains(w.as_str()))
            .cloned();

        if let Some(wake_word) = &found {
            tracing::info!(wake_word = %wake_word, transcript, "wake word detected");
        }
        found
    }

    /// Take the speech buffer, clearing it
    pub fn take_speech_buffer(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.speech_buffer)
    }

    /// Reset detector to idle state
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_buffer.clear();
        self.speech_frames = 0;
        self.silence_frames = 0;
    }

    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }
}

/// Lowercase, strip punctuation, collapse whitespace
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Always-on wake phrase listener
///
/// Candidate segments from the energy gate are verified by transcribing them.
pub struct WakeWordEngine {
    detector: WakeWordDetector,
    verifier: Arc<dyn SpeechEngine>,
}

impl WakeWordEngine {
    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationWarning` when no wake word is configured or no
    /// verification engine is available; callers fall back to hotkey-only
    pub fn new(
        wake_words: Vec<String>,
        verifier: Option<Arc<dyn SpeechEngine>>,
    ) -> Result<Self> {
        let detector = WakeWordDetector::new(wake_words)?;
        let verifier = verifier.ok_or_else(|| {
            Error::ConfigurationWarning(
                "no wake word credential, falling back to hotkey only".to_string(),
            )
        })?;

        Ok(Self { detector, verifier })
    }

    #[must_use]
    pub fn with_detector(detector: WakeWordDetector, verifier: Arc<dyn SpeechEngine>) -> Self {
        Self { detector, verifier }
    }

    /// Listen until a wake phrase is verified
    ///
    /// Returns `None` when cancelled or when the source ends.
    ///
    /// # Errors
    ///
    /// Returns error if the frame source fails
    pub async fn listen(
        &mut self,
        source: &mut dyn FrameSource,
        cancel: &CancellationToken,
    ) -> Result<Option<WakeDetection>> {
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                frame = source.next_frame() => frame?,
            };
            let Some(frame) = frame else {
                return Ok(None);
            };

            if !self.detector.process(&frame) {
                continue;
            }

            let segment = self.detector.take_speech_buffer();
            let wav = samples_to_wav(&segment, SAMPLE_RATE)?;

            let transcript = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                result = self.verifier.transcribe(&wav) => result,
            };

            match transcript {
                Ok(transcript) => {
                    if let Some(keyword_id) = self.detector.check_wake_word(&transcript.text) {
                        return Ok(Some(WakeDetection {
                            keyword_id,
                            at: Utc::now(),
                        }));
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "wake word verification failed");
                    self.detector.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::FRAME_SAMPLES;

    #[test]
    fn test_wake_word_detection() {
        let mut detector = WakeWordDetector::new(vec!["hey hark".to_string()]).unwrap();

        assert!(detector.check_wake_word("hello world").is_none());
        assert_eq!(detector.state(), DetectorState::Idle);

        assert_eq!(
            detector.check_wake_word("Hey, Hark! what's up?").as_deref(),
            Some("hey hark")
        );
    }

    #[test]
    fn test_empty_wake_words_warn() {
        let result = WakeWordDetector::new(vec!["  ".to_string()]);
        assert!(matches!(result, Err(Error::ConfigurationWarning(_))));
    }

    #[test]
    fn test_segment_needs_speech_then_silence() {
        let mut detector = WakeWordDetector::new(vec!["hey hark".to_string()]).unwrap();
        let loud = vec![0.2f32; FRAME_SAMPLES];
        let quiet = vec![0.0f32; FRAME_SAMPLES];

        for _ in 0..MIN_SPEECH_FRAMES {
            assert!(!detector.process(&loud));
        }
        let mut ready = false;
        for _ in 0..SILENCE_FRAMES {
            ready = detector.process(&quiet);
        }
        assert!(ready);
        assert!(!detector.take_speech_buffer().is_empty());
    }

    #[test]
    fn test_short_blip_is_discarded() {
        let mut detector = WakeWordDetector::new(vec!["hey hark".to_string()]).unwrap();
        detector.process(&vec![0.2f32; FRAME_SAMPLES]);
        for _ in 0..SILENCE_FRAMES {
            assert!(!detector.process(&vec![0.0f32; FRAME_SAMPLES]));
        }
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn test_missing_verifier_warns() {
        let result = WakeWordEngine::new(vec!["hey hark".to_string()], None);
        assert!(matches!(result, Err(Error::ConfigurationWarning(_))));
    }
}
