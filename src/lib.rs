//! vocalink - streaming pipeline runtime for real-time voice conversations
//!
//! Audio in, VAD turn detection, conversation context, a pluggable model
//! backend, audio and text out.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod context;
pub mod conversation;
pub mod defaults;
pub mod error;
pub mod frames;
#[cfg(feature = "cli")]
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod session;
pub mod task;
pub mod transport;

// Frames
pub use frames::{AudioChunk, CancelReason, Frame, FrameDirection, FrameKind, MetricsSample};

// Capabilities
pub use audio::vad::SpeechAnalyzer;
pub use model::ModelBackend;
pub use transport::Transport;

// Pipeline
pub use pipeline::orchestrator::{Pipeline, PipelineHandle};
pub use pipeline::processor::{FrameEmitter, Outbox, Processor};

// Session driving
pub use conversation::ConversationBuilder;
pub use runner::PipelineRunner;
pub use task::{PipelineTask, TaskHandle, TaskOutcome, TaskParams};

// Error handling
pub use error::{Result, VocalinkError};
pub use pipeline::error::{ErrorReporter, ProcessorError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
