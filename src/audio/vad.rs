//! Voice Activity Detection (VAD) module.
//!
//! Segments an audio stream into utterances. A pluggable [`SpeechAnalyzer`]
//! scores each chunk; the [`VadSegmenter`] state machine turns those scores
//! into SpeechStarted / SpeechStopped control frames.
//!
//! Timing is measured in audio time (the summed duration of observed
//! chunks), so segmentation does not depend on how fast chunks arrive.

use crate::defaults;
use crate::frames::{AudioChunk, Frame, FrameKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scores how likely a chunk of audio contains speech.
pub trait SpeechAnalyzer: Send {
    /// Returns a speech probability in `[0.0, 1.0]`.
    fn speech_probability(&mut self, chunk: &AudioChunk) -> f32;
}

/// Energy-based analyzer: normalized RMS scaled so `full_scale` maps to 1.0.
#[derive(Debug, Clone, Copy)]
pub struct RmsAnalyzer {
    full_scale: f32,
}

impl RmsAnalyzer {
    pub fn new(full_scale: f32) -> Self {
        Self { full_scale }
    }
}

impl Default for RmsAnalyzer {
    fn default() -> Self {
        Self::new(defaults::RMS_FULL_SCALE)
    }
}

impl SpeechAnalyzer for RmsAnalyzer {
    fn speech_probability(&mut self, chunk: &AudioChunk) -> f32 {
        if self.full_scale <= 0.0 {
            return 0.0;
        }
        (calculate_rms(&chunk.samples) / self.full_scale).clamp(0.0, 1.0)
    }
}

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Speech probability threshold (0.0 to 1.0).
    pub threshold: f32,
    /// Confirmation window: speech must hold this long before it counts.
    pub start_secs: f64,
    /// Continuous sub-threshold audio that ends an utterance.
    pub stop_secs: f64,
}

impl VadConfig {
    pub fn start_window(&self) -> Duration {
        window(self.start_secs)
    }

    pub fn stop_window(&self) -> Duration {
        window(self.stop_secs)
    }
}

// Negative and NaN clamp to zero, anything too large for a Duration saturates.
fn window(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            start_secs: defaults::VAD_START_SECS,
            stop_secs: defaults::VAD_STOP_SECS,
        }
    }
}

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Silence,
    /// Above threshold, waiting out the confirmation window.
    SpeechCandidate,
    /// Speech confirmed; SpeechStarted has been emitted.
    Speech,
}

/// Voice Activity Detector state machine for one audio stream.
pub struct VadSegmenter {
    config: VadConfig,
    analyzer: Box<dyn SpeechAnalyzer>,
    state: VadState,
    candidate_elapsed: Duration,
    silence_elapsed: Duration,
    last_probability: f32,
}

impl VadSegmenter {
    /// Creates a segmenter using the energy analyzer.
    pub fn new(config: VadConfig) -> Self {
        Self::with_analyzer(config, Box::new(RmsAnalyzer::default()))
    }

    /// Creates a segmenter with a custom speech analyzer.
    pub fn with_analyzer(config: VadConfig, analyzer: Box<dyn SpeechAnalyzer>) -> Self {
        Self {
            config,
            analyzer,
            state: VadState::Silence,
            candidate_elapsed: Duration::ZERO,
            silence_elapsed: Duration::ZERO,
            last_probability: 0.0,
        }
    }

    /// Classifies one chunk, returning a control frame on a speech boundary.
    pub fn observe(&mut self, chunk: &AudioChunk) -> Option<Frame> {
        let probability = self.analyzer.speech_probability(chunk);
        self.last_probability = probability;
        let is_speech = probability >= self.config.threshold;
        let elapsed = chunk.duration();

        match self.state {
            VadState::Silence => {
                if !is_speech {
                    return None;
                }
                self.state = VadState::SpeechCandidate;
                self.candidate_elapsed = elapsed;
                self.confirm()
            }
            VadState::SpeechCandidate => {
                if is_speech {
                    self.candidate_elapsed += elapsed;
                    self.confirm()
                } else {
                    // Dropped before confirmation: a blip, not speech.
                    self.state = VadState::Silence;
                    self.candidate_elapsed = Duration::ZERO;
                    None
                }
            }
            VadState::Speech => {
                if is_speech {
                    self.silence_elapsed = Duration::ZERO;
                    return None;
                }
                self.silence_elapsed += elapsed;
                if self.silence_elapsed >= self.config.stop_window() {
                    self.state = VadState::Silence;
                    self.silence_elapsed = Duration::ZERO;
                    Some(Frame::new(FrameKind::SpeechStopped))
                } else {
                    None
                }
            }
        }
    }

    fn confirm(&mut self) -> Option<Frame> {
        if self.candidate_elapsed < self.config.start_window() {
            return None;
        }
        self.state = VadState::Speech;
        self.candidate_elapsed = Duration::ZERO;
        self.silence_elapsed = Duration::ZERO;
        Some(Frame::new(FrameKind::SpeechStarted))
    }

    /// Returns the current VAD state.
    pub fn state(&self) -> VadState {
        self.state
    }

    /// Probability reported for the most recent chunk.
    pub fn last_probability(&self) -> f32 {
        self.last_probability
    }

    /// Sub-threshold audio accumulated since speech was last heard.
    pub fn silence_elapsed(&self) -> Duration {
        self.silence_elapsed
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Resets to silence and clears both timers.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.candidate_elapsed = Duration::ZERO;
        self.silence_elapsed = Duration::ZERO;
    }

    /// Updates the speech threshold without resetting state.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.threshold = threshold;
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
