//! Voice processing module
//!
//! Handles audio capture, segmentation, wake word detection, synthesis and
//! playback. Everything runs on 24 kHz mono frames.

mod capture;
mod listener;
mod playback;
mod resample;
mod tts;
mod vad;
mod wake_word;

pub use capture::{FRAME_SAMPLES, Frame, FrameSource, MicrophoneStream, SAMPLE_RATE, samples_to_wav};
pub use listener::{
    CaptureOutcome, CaptureSource, ListeningPolicy, SegmentEvent, Segmenter, SegmenterConfig,
    Utterance, capture_utterance, frames_in,
};
pub use playback::{AudioSink, Chime, DevicePlayback, apply_volume, decode_mp3, sine_tone};
pub use resample::{Framer, MonoResampler, downmix, resample};
pub use tts::{SynthesizedAudio, Synthesizer, TextToSpeech, TtsProvider, VoiceParams};
pub use vad::{EnergyVad, VoiceDetector, calculate_energy};
pub use wake_word::{DetectorState, WakeDetection, WakeWordDetector, WakeWordEngine};
