//! Audio analysis and file I/O.

pub mod vad;
pub mod wav;

pub use vad::{RmsAnalyzer, SpeechAnalyzer, VadConfig, VadSegmenter, VadState, calculate_rms};
pub use wav::{WavAudioSource, WavAudioWriter};
