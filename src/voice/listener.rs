//! Utterance segmentation
//!
//! Turns a frame stream into finalized utterances. The [`Segmenter`] is a
//! pure state machine over frames; [`capture_utterance`] drives it from a
//! [`FrameSource`] and honors the stop and cancel tokens.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::capture::{FRAME_SAMPLES, Frame, FrameSource, SAMPLE_RATE};
use super::vad::{EnergyVad, VoiceDetector};
use crate::config::ListeningConfig;
use crate::{Error, Result};

/// Consecutive speech frames required before onset is accepted (60 ms)
const MIN_SPEECH_FRAMES: usize = 3;

/// Frames kept from before onset so the first syllable is not clipped (300 ms)
const PRE_ROLL_FRAMES: usize = 15;

/// What started the capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    WakeWord,
    Hotkey,
    /// Start command from the UI
    Command,
}

/// How long a listening session stays open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningPolicy {
    /// Finalize on the first silence gap
    SingleShot,
    /// Keep re-arming after each turn until the stop phrase
    Extended,
}

/// A finalized speech segment
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub source: CaptureSource,
}

impl Utterance {
    /// Length of the captured audio
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Result of a listening attempt
#[derive(Debug)]
pub enum CaptureOutcome {
    Utterance(Utterance),
    /// Max wait elapsed (or stop arrived) before any speech
    NoSpeech,
}

/// Segmenter thresholds, in frames
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub vad_threshold: f32,
    pub silence_frames: usize,
    pub max_wait_frames: usize,
    pub max_utterance_frames: usize,
    pub min_speech_frames: usize,
    pub pre_roll_frames: usize,
}

impl SegmenterConfig {
    /// Derive frame counts from the listening configuration
    #[must_use]
    pub fn from_listening(config: &ListeningConfig, policy: ListeningPolicy) -> Self {
        let max_wait = match policy {
            ListeningPolicy::SingleShot => config.max_wait,
            ListeningPolicy::Extended => config.extended_max_wait,
        };

        Self {
            vad_threshold: config.vad_threshold,
            silence_frames: frames_in(config.silence),
            max_wait_frames: frames_in(max_wait),
            max_utterance_frames: frames_in(config.max_utterance),
            min_speech_frames: MIN_SPEECH_FRAMES,
            pre_roll_frames: PRE_ROLL_FRAMES,
        }
    }
}

/// Number of whole frames covering `duration` (at least one)
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn frames_in(duration: Duration) -> usize {
    let frame_ms = (FRAME_SAMPLES as u64 * 1000) / u64::from(SAMPLE_RATE);
    ((duration.as_millis() as u64).div_ceil(frame_ms)).max(1) as usize
}

/// Event produced for each pushed frame
#[derive(Debug, PartialEq)]
pub enum SegmentEvent {
    /// Nothing decided yet
    Pending,
    /// Speech onset accepted
    SpeechStarted,
    /// Silence gap or length cap reached; carries the segment samples
    Finalized(Vec<f32>),
    /// Max wait elapsed with no onset
    NoSpeech,
}

enum SegmentState {
    Waiting {
        waited: usize,
        pre_roll: VecDeque<Frame>,
        speech_run: usize,
    },
    InSpeech {
        buffer: Vec<f32>,
        silence: usize,
        frames: usize,
    },
    Done,
}

/// Frame-driven speech segmenter
pub struct Segmenter {
    config: SegmenterConfig,
    vad: Box<dyn VoiceDetector>,
    state: SegmentState,
}

impl Segmenter {
    #[must_use]
    pub fn new(config: SegmenterConfig) -> Self {
        let vad = Box::new(EnergyVad::new(config.vad_threshold));
        Self::with_detector(config, vad)
    }

    #[must_use]
    pub fn with_detector(config: SegmenterConfig, vad: Box<dyn VoiceDetector>) -> Self {
        Self {
            config,
            vad,
            state: SegmentState::Waiting {
                waited: 0,
                pre_roll: VecDeque::new(),
                speech_run: 0,
            },
        }
    }

    /// Whether onset has been accepted
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        matches!(self.state, SegmentState::InSpeech { .. })
    }

    /// Feed one frame
    pub fn push(&mut self, frame: &[f32]) -> SegmentEvent {
        let is_speech = self.vad.is_speech(frame, SAMPLE_RATE);

        match &mut self.state {
            SegmentState::Waiting {
                waited,
                pre_roll,
                speech_run,
            } => {
                *waited += 1;
                pre_roll.push_back(frame.to_vec());
                while pre_roll.len() > self.config.pre_roll_frames.max(self.config.min_speech_frames) {
                    pre_roll.pop_front();
                }

                *speech_run = if is_speech { *speech_run + 1 } else { 0 };

                if *speech_run >= self.config.min_speech_frames {
                    let buffer: Vec<f32> = pre_roll.drain(..).flatten().collect();
                    let frames = buffer.len() / FRAME_SAMPLES.max(1);
                    tracing::trace!(waited = *waited, "speech onset");
                    self.state = SegmentState::InSpeech {
                        buffer,
                        silence: 0,
                        frames,
                    };
                    return SegmentEvent::SpeechStarted;
                }

                if *waited >= self.config.max_wait_frames {
                    self.state = SegmentState::Done;
                    return SegmentEvent::NoSpeech;
                }

                SegmentEvent::Pending
            }
            SegmentState::InSpeech {
                buffer,
                silence,
                frames,
            } => {
                buffer.extend_from_slice(frame);
                *frames += 1;
                *silence = if is_speech { 0 } else { *silence + 1 };

                if *silence >= self.config.silence_frames {
                    tracing::debug!(frames = *frames, "silence gap, finalizing");
                    return self.finalize();
                }
                if *frames >= self.config.max_utterance_frames {
                    tracing::debug!(frames = *frames, "utterance length cap reached");
                    return self.finalize();
                }

                SegmentEvent::Pending
            }
            SegmentState::Done => SegmentEvent::Pending,
        }
    }

    /// Explicit stop: finalize whatever speech has been collected
    pub fn finish(&mut self) -> SegmentEvent {
        match self.state {
            SegmentState::InSpeech { .. } => self.finalize(),
            SegmentState::Waiting { .. } => {
                self.state = SegmentState::Done;
                SegmentEvent::NoSpeech
            }
            SegmentState::Done => SegmentEvent::Pending,
        }
    }

    fn finalize(&mut self) -> SegmentEvent {
        match std::mem::replace(&mut self.state, SegmentState::Done) {
            SegmentState::InSpeech { buffer, .. } => SegmentEvent::Finalized(buffer),
            _ => SegmentEvent::NoSpeech,
        }
    }
}

/// Listen on `source` until one utterance is finalized
///
/// `stop` finalizes whatever has been heard so far; `cancel` abandons the
/// capture and returns `Error::Cancelled`.
///
/// # Errors
///
/// Returns `Error::Cancelled` on cancel, or the source's device error
pub async fn capture_utterance(
    source: &mut dyn FrameSource,
    mut segmenter: Segmenter,
    origin: CaptureSource,
    stop: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<CaptureOutcome> {
    let mut started_at = None;

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = stop.cancelled() => segmenter.finish(),
            frame = source.next_frame() => match frame? {
                Some(frame) => segmenter.push(&frame),
                None => segmenter.finish(),
            },
        };

        match event {
            SegmentEvent::Pending => {}
            SegmentEvent::SpeechStarted => {
                started_at = Some(Utc::now());
            }
            SegmentEvent::Finalized(samples) => {
                let ended_at = Utc::now();
                let utterance = Utterance {
                    samples,
                    sample_rate: SAMPLE_RATE,
                    started_at: started_at.unwrap_or(ended_at),
                    ended_at,
                    source: origin,
                };
                tracing::info!(
                    duration_ms = utterance.duration().as_millis(),
                    source = ?origin,
                    "utterance captured"
                );
                return Ok(CaptureOutcome::Utterance(utterance));
            }
            SegmentEvent::NoSpeech => {
                tracing::debug!(source = ?origin, "no speech before max wait");
                return Ok(CaptureOutcome::NoSpeech);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmenterConfig {
        SegmenterConfig {
            vad_threshold: 0.1,
            silence_frames: 5,
            max_wait_frames: 20,
            max_utterance_frames: 100,
            min_speech_frames: 3,
            pre_roll_frames: 4,
        }
    }

    fn loud() -> Vec<f32> {
        vec![0.5; FRAME_SAMPLES]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; FRAME_SAMPLES]
    }

    #[test]
    fn test_onset_needs_consecutive_speech() {
        let mut seg = Segmenter::new(config());

        assert_eq!(seg.push(&loud()), SegmentEvent::Pending);
        assert_eq!(seg.push(&quiet()), SegmentEvent::Pending);
        assert_eq!(seg.push(&loud()), SegmentEvent::Pending);
        assert_eq!(seg.push(&loud()), SegmentEvent::Pending);
        assert_eq!(seg.push(&loud()), SegmentEvent::SpeechStarted);
        assert!(seg.in_speech());
    }

    #[test]
    fn test_silence_gap_finalizes_with_pre_roll() {
        let mut seg = Segmenter::new(config());
        seg.push(&quiet());
        for _ in 0..3 {
            seg.push(&loud());
        }
        for _ in 0..4 {
            assert_eq!(seg.push(&quiet()), SegmentEvent::Pending);
        }

        let SegmentEvent::Finalized(samples) = seg.push(&quiet()) else {
            panic!("expected finalized segment");
        };
        // 4 pre-roll frames (1 quiet + 3 loud) + 5 trailing silence frames
        assert_eq!(samples.len(), 9 * FRAME_SAMPLES);
    }

    #[test]
    fn test_max_wait_yields_no_speech() {
        let mut seg = Segmenter::new(config());
        for _ in 0..19 {
            assert_eq!(seg.push(&quiet()), SegmentEvent::Pending);
        }
        assert_eq!(seg.push(&quiet()), SegmentEvent::NoSpeech);
    }

    #[test]
    fn test_length_cap_finalizes() {
        let mut cfg = config();
        cfg.max_utterance_frames = 10;
        let mut seg = Segmenter::new(cfg);

        let mut finalized = false;
        for _ in 0..20 {
            if let SegmentEvent::Finalized(_) = seg.push(&loud()) {
                finalized = true;
                break;
            }
        }
        assert!(finalized);
    }

    #[test]
    fn test_finish_before_onset_is_no_speech() {
        let mut seg = Segmenter::new(config());
        seg.push(&quiet());
        assert_eq!(seg.finish(), SegmentEvent::NoSpeech);
    }

    #[test]
    fn test_policy_windows() {
        let listening = ListeningConfig::default();
        let single = SegmenterConfig::from_listening(&listening, ListeningPolicy::SingleShot);
        let extended = SegmenterConfig::from_listening(&listening, ListeningPolicy::Extended);

        assert_eq!(single.max_wait_frames, 500);
        assert_eq!(extended.max_wait_frames, 300);
        assert_eq!(single.silence_frames, 40);
    }

    #[test]
    fn test_frames_in_rounds_up() {
        assert_eq!(frames_in(Duration::from_millis(30)), 2);
        assert_eq!(frames_in(Duration::ZERO), 1);
    }
}
