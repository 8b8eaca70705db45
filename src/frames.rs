//! Frame taxonomy shared by every processor.
//!
//! A [`Frame`] is the unit that moves through the pipeline. Its [`FrameKind`]
//! is a closed set; processors match on it exhaustively or forward what they
//! don't care about.

use crate::context::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Direction a frame travels through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDirection {
    /// From the transport input towards the transport output.
    Downstream,
    /// From later processors back towards the source.
    Upstream,
}

impl FrameDirection {
    pub fn reverse(self) -> Self {
        match self {
            FrameDirection::Downstream => FrameDirection::Upstream,
            FrameDirection::Upstream => FrameDirection::Downstream,
        }
    }
}

/// Mono or interleaved 16-bit PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playback duration of this chunk. Zero for a zero sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames() as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Why a pipeline is being torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit `cancel()` call.
    Requested,
    ClientDisconnected,
    IdleTimeout,
    /// Process-level interrupt or terminate signal.
    Interrupted,
    ProcessorFailure { processor: String, message: String },
    BackendFailure { processor: String, message: String },
    TransportFailure { message: String },
}

impl CancelReason {
    /// True for reasons caused by a failure rather than a normal shutdown.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CancelReason::ProcessorFailure { .. }
                | CancelReason::BackendFailure { .. }
                | CancelReason::TransportFailure { .. }
        )
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancel requested"),
            CancelReason::ClientDisconnected => write!(f, "client disconnected"),
            CancelReason::IdleTimeout => write!(f, "idle timeout"),
            CancelReason::Interrupted => write!(f, "interrupted by signal"),
            CancelReason::ProcessorFailure { processor, message } => {
                write!(f, "processor {} failed: {}", processor, message)
            }
            CancelReason::BackendFailure { processor, message } => {
                write!(f, "model backend in {} failed: {}", processor, message)
            }
            CancelReason::TransportFailure { message } => {
                write!(f, "transport failed: {}", message)
            }
        }
    }
}

/// A single observability measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsSample {
    /// Time from a run trigger to the first response fragment.
    Ttfb { processor: String, value: Duration },
    /// Wall time spent inside a processor handler for one run.
    Processing { processor: String, value: Duration },
    /// Token usage reported by the model backend.
    Usage {
        processor: String,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
}

/// Payload of a [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    // Lifecycle
    End,
    Cancel(CancelReason),
    Interruption,

    // Audio
    InputAudio(AudioChunk),
    OutputAudio(AudioChunk),

    // Voice activity
    SpeechStarted,
    SpeechStopped,

    // User turn
    Transcription { text: String, is_final: bool },
    EndOfTurn,
    AppendMessages(Vec<Message>),
    RunTrigger,

    // Model response
    ResponseStarted,
    TextDelta(String),
    ResponseCompleted,

    // Observability
    Metrics(MetricsSample),
    Heartbeat,
}

/// An immutable unit of data or control moving through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    id: u64,
    kind: FrameKind,
}

impl Frame {
    /// Create a frame with the next sequence id.
    pub fn new(kind: FrameKind) -> Self {
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn into_kind(self) -> FrameKind {
        self.kind
    }

    pub fn cancel(reason: CancelReason) -> Self {
        Self::new(FrameKind::Cancel(reason))
    }

    pub fn end() -> Self {
        Self::new(FrameKind::End)
    }

    pub fn run_trigger() -> Self {
        Self::new(FrameKind::RunTrigger)
    }

    pub fn input_audio(chunk: AudioChunk) -> Self {
        Self::new(FrameKind::InputAudio(chunk))
    }

    pub fn output_audio(chunk: AudioChunk) -> Self {
        Self::new(FrameKind::OutputAudio(chunk))
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::new(FrameKind::TextDelta(text.into()))
    }

    pub fn transcription(text: impl Into<String>, is_final: bool) -> Self {
        Self::new(FrameKind::Transcription {
            text: text.into(),
            is_final,
        })
    }

    pub fn append_messages(messages: Vec<Message>) -> Self {
        Self::new(FrameKind::AppendMessages(messages))
    }

    pub fn metrics(sample: MetricsSample) -> Self {
        Self::new(FrameKind::Metrics(sample))
    }

    /// System frames skip the data lane so they are never stuck behind
    /// queued audio.
    pub fn is_system(&self) -> bool {
        matches!(self.kind, FrameKind::Cancel(_) | FrameKind::Interruption)
    }

    /// Frames that may be discarded when a link is full.
    pub fn is_droppable(&self) -> bool {
        matches!(self.kind, FrameKind::Metrics(_) | FrameKind::Heartbeat)
    }

    /// Frames that count as session activity for idle detection.
    pub fn is_activity(&self) -> bool {
        !self.is_droppable()
    }

    /// Short label used in logs and events.
    pub fn name(&self) -> &'static str {
        match self.kind {
            FrameKind::End => "End",
            FrameKind::Cancel(_) => "Cancel",
            FrameKind::Interruption => "Interruption",
            FrameKind::InputAudio(_) => "InputAudio",
            FrameKind::OutputAudio(_) => "OutputAudio",
            FrameKind::SpeechStarted => "SpeechStarted",
            FrameKind::SpeechStopped => "SpeechStopped",
            FrameKind::Transcription { .. } => "Transcription",
            FrameKind::EndOfTurn => "EndOfTurn",
            FrameKind::AppendMessages(_) => "AppendMessages",
            FrameKind::RunTrigger => "RunTrigger",
            FrameKind::ResponseStarted => "ResponseStarted",
            FrameKind::TextDelta(_) => "TextDelta",
            FrameKind::ResponseCompleted => "ResponseCompleted",
            FrameKind::Metrics(_) => "Metrics",
            FrameKind::Heartbeat => "Heartbeat",
        }
    }
}

impl From<FrameKind> for Frame {
    fn from(kind: FrameKind) -> Self {
        Frame::new(kind)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_ids_increase() {
        let a = Frame::new(FrameKind::SpeechStarted);
        let b = Frame::new(FrameKind::SpeechStopped);
        let c = Frame::run_trigger();
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
    }

    #[test]
    fn test_audio_chunk_duration() {
        let chunk = AudioChunk::new(vec![0; 320], 16000);
        assert_eq!(chunk.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_audio_chunk_duration_stereo() {
        let chunk = AudioChunk {
            samples: vec![0; 640],
            sample_rate: 16000,
            channels: 2,
        };
        assert_eq!(chunk.frames(), 320);
        assert_eq!(chunk.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_audio_chunk_zero_rate() {
        let chunk = AudioChunk::new(vec![0; 100], 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }

    #[test]
    fn test_system_frames() {
        assert!(Frame::cancel(CancelReason::Requested).is_system());
        assert!(Frame::new(FrameKind::Interruption).is_system());
        assert!(!Frame::run_trigger().is_system());
        assert!(!Frame::end().is_system());
    }

    #[test]
    fn test_droppable_frames() {
        assert!(Frame::new(FrameKind::Heartbeat).is_droppable());
        assert!(
            Frame::metrics(MetricsSample::Ttfb {
                processor: "model".to_string(),
                value: Duration::from_millis(5),
            })
            .is_droppable()
        );
        assert!(!Frame::text_delta("hi").is_droppable());
        assert!(!Frame::input_audio(AudioChunk::new(vec![0; 10], 16000)).is_droppable());
    }

    #[test]
    fn test_activity_excludes_droppable() {
        assert!(!Frame::new(FrameKind::Heartbeat).is_activity());
        assert!(Frame::new(FrameKind::SpeechStarted).is_activity());
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(
            FrameDirection::Downstream.reverse(),
            FrameDirection::Upstream
        );
        assert_eq!(
            FrameDirection::Upstream.reverse(),
            FrameDirection::Downstream
        );
    }

    #[test]
    fn test_cancel_reason_display() {
        let reason = CancelReason::ProcessorFailure {
            processor: "vad".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(reason.to_string(), "processor vad failed: boom");
        assert_eq!(CancelReason::IdleTimeout.to_string(), "idle timeout");
    }

    #[test]
    fn test_cancel_reason_is_failure() {
        assert!(
            CancelReason::TransportFailure {
                message: "x".to_string()
            }
            .is_failure()
        );
        assert!(!CancelReason::ClientDisconnected.is_failure());
        assert!(!CancelReason::Requested.is_failure());
    }

    #[test]
    fn test_cancel_reason_serializes_tagged() {
        let json = serde_json::to_string(&CancelReason::IdleTimeout).unwrap();
        assert_eq!(json, r#"{"kind":"idle_timeout"}"#);
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::run_trigger();
        assert_eq!(frame.to_string(), format!("RunTrigger#{}", frame.id()));
    }
}
