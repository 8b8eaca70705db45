//! VAD processor that turns input audio into speech boundary frames.

use crate::audio::vad::{SpeechAnalyzer, VadConfig, VadSegmenter, VadState};
use crate::frames::{CancelReason, Frame, FrameDirection, FrameKind};
use crate::pipeline::error::ProcessorError;
use crate::pipeline::processor::{Outbox, Processor};
use async_trait::async_trait;
use tracing::{debug, trace};

/// Emits SpeechStarted / SpeechStopped ahead of the audio chunk that caused
/// the transition. Every frame, audio included, is forwarded.
pub struct VadProcessor {
    segmenter: VadSegmenter,
}

impl VadProcessor {
    /// Creates a new VAD processor with the energy analyzer.
    pub fn new(config: VadConfig) -> Self {
        Self {
            segmenter: VadSegmenter::new(config),
        }
    }

    /// Creates a new VAD processor with a custom analyzer.
    pub fn with_analyzer(config: VadConfig, analyzer: Box<dyn SpeechAnalyzer>) -> Self {
        Self {
            segmenter: VadSegmenter::with_analyzer(config, analyzer),
        }
    }

    pub fn state(&self) -> VadState {
        self.segmenter.state()
    }
}

#[async_trait]
impl Processor for VadProcessor {
    fn name(&self) -> &str {
        "vad"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        if direction == FrameDirection::Downstream
            && let FrameKind::InputAudio(chunk) = frame.kind()
        {
            if let Some(event) = self.segmenter.observe(chunk) {
                debug!(
                    event = event.name(),
                    probability = self.segmenter.last_probability(),
                    "speech boundary"
                );
                out.push(event);
            } else {
                trace!(probability = self.segmenter.last_probability(), "vad");
            }
        }
        out.forward(frame, direction);
        Ok(())
    }

    async fn on_end(&mut self, out: &mut Outbox) -> Result<(), ProcessorError> {
        // Input ran out mid-utterance: close the turn so it can still commit.
        if self.segmenter.state() == VadState::Speech {
            out.push(FrameKind::SpeechStopped);
        }
        self.segmenter.reset();
        Ok(())
    }

    async fn on_cancel(&mut self, _reason: &CancelReason) {
        self.segmenter.reset();
    }
}
