//! Frame pipeline runtime.
//!
//! Each processor runs in its own tokio task, connected to its neighbors by
//! two-lane links: a bounded data lane for backpressure and a priority lane
//! for system frames.

pub mod error;
pub mod link;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod vad_processor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorReporter, LogReporter, ProcessorError};
pub use link::{LinkClosed, LinkReceiver, LinkSender, link};
pub use metrics::{LatencyStats, LatencyTracker, ProcessorCounters, ProcessorStats, TurnTiming};
pub use orchestrator::{LinkedPipeline, Pipeline, PipelineHandle};
pub use processor::{FrameEmitter, Outbox, Processor, ProcessorRunner};
pub use vad_processor::VadProcessor;
