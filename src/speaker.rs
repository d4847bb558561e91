//! Preemptible speech output
//!
//! There is no queue: a new request cancels whatever is being synthesized or
//! played and takes over the output device once the previous output has
//! released it.

use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::voice::{AudioSink, SynthesizedAudio, Synthesizer, VoiceParams, apply_volume};
use crate::{Error, Result};

/// One thing to say
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub text: String,
    pub voice: VoiceParams,
    /// Output gain between 0.0 and 1.0
    pub volume: f32,
    /// Audio the model already produced; skips synthesis
    pub prerendered: Option<SynthesizedAudio>,
}

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// A newer request took over
    Superseded,
    Cancelled,
}

struct Current {
    generation: u64,
    token: Option<CancellationToken>,
}

/// Speech synthesis plus exclusive audio output
pub struct Speaker {
    synthesizer: Option<Arc<dyn Synthesizer>>,
    sink: Arc<dyn AudioSink>,
    current: Mutex<Current>,
    output: AsyncMutex<()>,
}

impl Speaker {
    #[must_use]
    pub fn new(synthesizer: Option<Arc<dyn Synthesizer>>, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            synthesizer,
            sink,
            current: Mutex::new(Current {
                generation: 0,
                token: None,
            }),
            output: AsyncMutex::new(()),
        }
    }

    /// Whether text can be synthesized
    #[must_use]
    pub fn can_synthesize(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Cancel any in-flight synthesis or output
    pub fn stop(&self) {
        if let Ok(mut current) = self.current.lock()
            && let Some(token) = current.token.take()
        {
            token.cancel();
        }
    }

    /// Speak a request, superseding any in-flight one
    ///
    /// # Errors
    ///
    /// Returns `Error::Tts` when synthesis fails or `Error::Device` when the
    /// output device fails; both are non-fatal to the caller
    pub async fn speak(
        &self,
        request: PlaybackRequest,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        let token = cancel.child_token();
        let generation = self.take_over(token.clone());
        let outcome = || {
            if cancel.is_cancelled() {
                PlaybackOutcome::Cancelled
            } else {
                PlaybackOutcome::Superseded
            }
        };

        let audio = match request.prerendered {
            Some(audio) => audio,
            None if request.text.trim().is_empty() => return Ok(PlaybackOutcome::Completed),
            None => {
                let synthesizer = self
                    .synthesizer
                    .as_ref()
                    .ok_or_else(|| Error::Tts("no speech synthesizer configured".to_string()))?;
                tokio::select! {
                    () = token.cancelled() => return Ok(outcome()),
                    audio = synthesizer.synthesize(&request.text, &request.voice) => audio?,
                }
            }
        };

        // Waits for a superseded output to release the device
        let _output = tokio::select! {
            () = token.cancelled() => return Ok(outcome()),
            guard = self.output.lock() => guard,
        };

        let mut samples = audio.samples;
        apply_volume(&mut samples, request.volume);
        tracing::debug!(
            samples = samples.len(),
            sample_rate = audio.sample_rate,
            "starting playback"
        );

        let played = self.sink.play(samples, audio.sample_rate, token.clone()).await;
        self.release(generation);
        played?;

        if token.is_cancelled() {
            Ok(outcome())
        } else {
            Ok(PlaybackOutcome::Completed)
        }
    }

    /// Play a short cue once the output is free
    ///
    /// Cues wait their turn instead of superseding speech, and are not
    /// cancelled by [`Speaker::stop`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` when the output device fails
    pub async fn cue(&self, mut samples: Vec<f32>, sample_rate: u32, volume: f32) -> Result<()> {
        apply_volume(&mut samples, volume);
        let _output = self.output.lock().await;
        self.sink
            .play(samples, sample_rate, CancellationToken::new())
            .await
    }

    fn take_over(&self, token: CancellationToken) -> u64 {
        let Ok(mut current) = self.current.lock() else {
            return 0;
        };
        if let Some(previous) = current.token.replace(token) {
            tracing::debug!("superseding in-flight playback");
            previous.cancel();
        }
        current.generation += 1;
        current.generation
    }

    fn release(&self, generation: u64) {
        if let Ok(mut current) = self.current.lock()
            && current.generation == generation
        {
            current.token = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    /// Sink that plays for a fixed time and tracks overlapping outputs
    #[derive(Default)]
    struct TimedSink {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for TimedSink {
        async fn play(&self, _samples: Vec<f32>, _rate: u32, cancel: CancellationToken) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request() -> PlaybackRequest {
        PlaybackRequest {
            text: String::new(),
            voice: VoiceParams {
                voice: "alloy".into(),
                speed: 1.0,
            },
            volume: 1.0,
            prerendered: Some(SynthesizedAudio {
                samples: vec![0.1; 240],
                sample_rate: 24_000,
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_supersedes() {
        let sink = Arc::new(TimedSink::default());
        let speaker = Arc::new(Speaker::new(None, sink.clone()));
        let cancel = CancellationToken::new();

        let first = {
            let speaker = Arc::clone(&speaker);
            let cancel = cancel.clone();
            tokio::spawn(async move { speaker.speak(request(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = speaker.speak(request(), &cancel).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first, PlaybackOutcome::Superseded);
        assert_eq!(second, PlaybackOutcome::Completed);
        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_token_stops_playback() {
        let speaker = Speaker::new(None, Arc::new(TimedSink::default()));
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let outcome = speaker.speak(request(), &cancel).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_synthesizer_is_tts_error() {
        let speaker = Speaker::new(None, Arc::new(TimedSink::default()));
        let mut req = request();
        req.prerendered = None;
        req.text = "hello".into();
        let err = speaker.speak(req, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Tts(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cue_waits_for_speech_to_release_output() {
        let sink = Arc::new(TimedSink::default());
        let speaker = Arc::new(Speaker::new(None, sink.clone()));

        let speech = {
            let speaker = Arc::clone(&speaker);
            tokio::spawn(async move { speaker.speak(request(), &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        speaker.cue(vec![0.1; 100], 24_000, 0.5).await.unwrap();
        assert_eq!(speech.await.unwrap().unwrap(), PlaybackOutcome::Completed);
        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    }
}
