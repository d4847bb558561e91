//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use super::resample::resample;
use crate::{Error, Result};

/// Something that can play mono samples
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play to completion, or stop early once `cancel` fires
    async fn play(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Plays audio on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct DevicePlayback;

impl DevicePlayback {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSink for DevicePlayback {
    async fn play(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        cancel: CancellationToken,
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || play_samples_blocking(samples, sample_rate, &cancel))
            .await
            .map_err(|e| Error::Device(format!("playback task failed: {e}")))?
    }
}

/// Play samples on the calling thread, polling `cancel`
fn play_samples_blocking(samples: Vec<f32>, sample_rate: u32, cancel: &CancellationToken) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let config = select_output_config(&device, sample_rate)?;
    let samples = if config.sample_rate.0 == sample_rate {
        samples
    } else {
        resample(&samples, sample_rate, config.sample_rate.0)?
    };

    let channels = usize::from(config.channels);
    let sample_count = samples.len();
    let finished = Arc::new(AtomicBool::new(false));
    let finished_cb = Arc::clone(&finished);
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    if position < samples.len() {
                        position += 1;
                    } else {
                        finished_cb.store(true, Ordering::Release);
                    }
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(config.sample_rate.0);
    let start = Instant::now();
    let timeout = Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::Acquire) {
        if cancel.is_cancelled() {
            tracing::debug!("playback cancelled");
            return Ok(());
        }
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // Let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}

fn select_output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let matching = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
    };

    if let Some(range) = matching(1).or_else(|| matching(2)) {
        return Ok(range.with_sample_rate(SampleRate(sample_rate)).config());
    }

    let default = device
        .default_output_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    if default.sample_format() != SampleFormat::F32 {
        return Err(Error::Device(format!(
            "unsupported output sample format: {:?}",
            default.sample_format()
        )));
    }
    Ok(default.config())
}

/// Scale samples by `volume` (clamped to 0.0..=1.0)
pub fn apply_volume(samples: &mut [f32], volume: f32) {
    let volume = volume.clamp(0.0, 1.0);
    if (volume - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in samples.iter_mut() {
        *s *= volume;
    }
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                let frame_samples: Vec<f32> = if frame.channels == 2 {
                    frame
                        .data
                        .chunks(2)
                        .map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            f32::midpoint(left, right)
                        })
                        .collect()
                } else {
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
                };

                samples.extend(frame_samples);
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("MP3 stream contained no frames".to_string()));
    }

    Ok((samples, sample_rate))
}

/// Generate a sine tone, used by the speaker diagnostic and chimes
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn sine_tone(frequency: f32, duration: Duration, sample_rate: u32) -> Vec<f32> {
    let count = (duration.as_secs_f32() * sample_rate as f32) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (t * frequency * std::f32::consts::TAU).sin() * 0.3
        })
        .collect()
}

/// Cue played when a listening session opens or closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chime {
    Start,
    Stop,
}

impl Chime {
    /// Two short notes, rising for start and falling for stop
    #[must_use]
    pub fn render(self, sample_rate: u32) -> Vec<f32> {
        let (first, second) = match self {
            Self::Start => (660.0, 880.0),
            Self::Stop => (880.0, 587.0),
        };
        let note = Duration::from_millis(70);
        let mut samples = sine_tone(first, note, sample_rate);
        samples.extend(sine_tone(second, note, sample_rate));
        samples
    }
}
