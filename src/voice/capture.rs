//! Audio capture from microphone

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::resample::{Framer, downmix};
use crate::{Error, Result};

/// Sample rate for all captured and synthesized audio
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per VAD frame (20 ms at 24 kHz)
pub const FRAME_SAMPLES: usize = 480;

/// Frames buffered between the device callback and the consumer
const FRAME_QUEUE: usize = 256;

/// One fixed-size block of mono samples at [`SAMPLE_RATE`]
pub type Frame = Vec<f32>;

/// A stream of audio frames
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Continuous capture from the default input device
///
/// The cpal stream lives on its own thread since it is not `Send`; frames
/// are handed over through a bounded channel and dropped if the consumer
/// falls behind.
pub struct MicrophoneStream {
    frames: mpsc::Receiver<Result<Frame>>,
    running: Arc<AtomicBool>,
}

impl MicrophoneStream {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no input device can be opened
    pub async fn open() -> Result<Self> {
        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        std::thread::Builder::new()
            .name("hark-capture".to_string())
            .spawn(move || capture_thread(frame_tx, ready_tx, &thread_running))
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| Error::Device("capture thread exited during setup".to_string()))??;

        Ok(Self { frames, running })
    }
}

#[async_trait]
impl FrameSource for MicrophoneStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.frames.recv().await.transpose()
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn capture_thread(
    frame_tx: mpsc::Sender<Result<Frame>>,
    ready_tx: oneshot::Sender<Result<()>>,
    running: &AtomicBool,
) {
    let stream = match build_stream(frame_tx.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::Device(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    tracing::debug!("audio capture started");

    while running.load(Ordering::Acquire) && !frame_tx.is_closed() {
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!("audio capture stopped");
}

fn build_stream(frame_tx: mpsc::Sender<Result<Frame>>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let supported = select_input_config(&device)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        channels,
        format = ?sample_format,
        "audio capture initialized"
    );

    let mut framer = Framer::new(config.sample_rate.0)?;
    let mut deliver = move |mono: &[f32]| match framer.push(mono) {
        Ok(frames) => {
            for frame in frames {
                // Full queue means the consumer is behind; drop rather than block the callback
                let _ = frame_tx.try_send(Ok(frame));
            }
        }
        Err(e) => {
            let _ = frame_tx.try_send(Err(e));
        }
    };

    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "audio capture error");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| deliver(&downmix(data, channels)),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                deliver(&downmix(&converted, channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(Error::Device(format!(
                "unsupported input sample format: {other:?}"
            )));
        }
    }
    .map_err(|e| Error::Device(e.to_string()))?;

    Ok(stream)
}

/// Prefer a native 24 kHz config, otherwise take the device default and resample
fn select_input_config(device: &cpal::Device) -> Result<SupportedStreamConfig> {
    let native = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        });

    match native {
        Some(range) => Ok(range.with_sample_rate(SampleRate(SAMPLE_RATE))),
        None => device
            .default_input_config()
            .map_err(|e| Error::Device(e.to_string())),
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_and_length() {
        let samples = vec![0.0f32; FRAME_SAMPLES];
        let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte header + 2 bytes per sample
        assert_eq!(wav.len(), 44 + FRAME_SAMPLES * 2);
    }

    #[test]
    fn test_wav_clamps_out_of_range() {
        let wav = samples_to_wav(&[2.0, -2.0], SAMPLE_RATE).unwrap();
        let mut reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![32767, -32768]);
    }

    #[test]
    fn test_frame_is_twenty_ms() {
        assert_eq!(FRAME_SAMPLES as u32 * 1000 / SAMPLE_RATE, 20);
    }
}
