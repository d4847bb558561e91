//! Voice activity detection

/// Trait for voice activity detection backends
pub trait VoiceDetector: Send {
    /// Returns true if the audio frame likely contains speech
    fn is_speech(&mut self, samples: &[f32], sample_rate: u32) -> bool;

    fn name(&self) -> &str;
}

/// Energy-based VAD: RMS of the frame against a fixed threshold
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl VoiceDetector for EnergyVad {
    fn is_speech(&mut self, samples: &[f32], _sample_rate: u32) -> bool {
        !samples.is_empty() && calculate_energy(samples) > self.threshold
    }

    fn name(&self) -> &str {
        "energy"
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 480];
        assert!(calculate_energy(&silence) < 0.001);

        let loud = vec![0.5f32; 480];
        assert!(calculate_energy(&loud) > 0.4);
        assert!(calculate_energy(&[]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_threshold_against_rms() {
        // RMS of a constant signal is its amplitude
        let mut vad = EnergyVad::new(0.1);
        assert!(!vad.is_speech(&[0.09f32; 480], 24_000));
        assert!(vad.is_speech(&[0.11f32; 480], 24_000));
    }

    #[test]
    fn test_empty_frame_is_not_speech() {
        let mut vad = EnergyVad::new(0.0);
        assert!(!vad.is_speech(&[], 24_000));
    }
}
