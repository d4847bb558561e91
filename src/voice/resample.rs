//! Sample-rate conversion and fixed-size framing

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

use super::capture::{FRAME_SAMPLES, SAMPLE_RATE};

/// Input chunk handed to the FFT resampler
const RESAMPLER_CHUNK: usize = 1024;

/// Mono converter from an arbitrary device rate to 24 kHz
pub struct MonoResampler {
    inner: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl MonoResampler {
    /// Create a resampler from `from_rate` to `to_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the rates are not supported
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLER_CHUNK,
            2,
            1,
        )
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Push samples; returns whatever output is ready
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects a chunk
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();

        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let processed = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            if let Some(channel) = processed.into_iter().next() {
                out.extend(channel);
            }
        }

        Ok(out)
    }

    /// Flush buffered input, padding the final chunk
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects the final chunk
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = std::mem::take(&mut self.pending);
        let processed = self
            .inner
            .process_partial(Some(&[chunk]), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        Ok(processed.into_iter().next().unwrap_or_default())
    }
}

/// Resample a whole buffer in one go
///
/// # Errors
///
/// Returns error if the rates are not supported
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = MonoResampler::new(from_rate, to_rate)?;
    let mut out = resampler.push(samples)?;
    out.extend(resampler.finish()?);
    Ok(out)
}

/// Average interleaved channels down to mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Turns device callbacks of arbitrary size into 20 ms frames at 24 kHz
pub struct Framer {
    resampler: Option<MonoResampler>,
    buffer: Vec<f32>,
}

impl Framer {
    /// Create a framer for a device running at `device_rate`
    ///
    /// # Errors
    ///
    /// Returns error if a resampler is needed and cannot be built
    pub fn new(device_rate: u32) -> Result<Self> {
        let resampler = if device_rate == SAMPLE_RATE {
            None
        } else {
            tracing::debug!(device_rate, target_rate = SAMPLE_RATE, "resampling capture");
            Some(MonoResampler::new(device_rate, SAMPLE_RATE)?)
        };

        Ok(Self {
            resampler,
            buffer: Vec::with_capacity(FRAME_SAMPLES * 4),
        })
    }

    /// Feed mono samples, returning complete frames
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        match self.resampler.as_mut() {
            Some(r) => {
                let converted = r.push(samples)?;
                self.buffer.extend(converted);
            }
            None => self.buffer.extend_from_slice(samples),
        }

        let complete = self.buffer.len() / FRAME_SAMPLES;
        let frames = self
            .buffer
            .drain(..complete * FRAME_SAMPLES)
            .collect::<Vec<_>>()
            .chunks(FRAME_SAMPLES)
            .map(<[f32]>::to_vec)
            .collect();
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_chunks_native_rate() {
        let mut framer = Framer::new(SAMPLE_RATE).unwrap();

        let frames = framer.push(&vec![0.1; 1000]).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SAMPLES));

        // 40 leftover + 440 completes one more frame
        let frames = framer.push(&vec![0.1; 440]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_framer_resamples_48k() {
        let mut framer = Framer::new(48_000).unwrap();
        let mut total = 0;
        for _ in 0..10 {
            total += framer.push(&vec![0.0; 4800]).unwrap().len();
        }
        // One second at 48 kHz is about 50 frames at 24 kHz
        assert!((45..=50).contains(&total), "got {total} frames");
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.3, 0.4], 1), vec![0.3, 0.4]);
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.25; 100];
        assert_eq!(resample(&samples, 24_000, 24_000).unwrap(), samples);
    }
}
