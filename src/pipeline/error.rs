//! Error types and reporting for pipeline processors.

use crate::frames::CancelReason;
use std::fmt;
use tracing::{error, warn};

/// Errors that can occur while a processor handles a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorError {
    /// Recoverable error that allows the processor to continue processing.
    Recoverable(String),
    /// Fatal error; the pipeline is cancelled.
    Fatal(String),
    /// The model backend failed or disconnected mid-stream; the pipeline is cancelled.
    Backend(String),
}

impl ProcessorError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProcessorError::Recoverable(_))
    }

    /// Cancel reason propagated when this error tears the pipeline down.
    pub fn cancel_reason(&self, processor: &str) -> CancelReason {
        match self {
            ProcessorError::Recoverable(msg) | ProcessorError::Fatal(msg) => {
                CancelReason::ProcessorFailure {
                    processor: processor.to_string(),
                    message: msg.clone(),
                }
            }
            ProcessorError::Backend(msg) => CancelReason::BackendFailure {
                processor: processor.to_string(),
                message: msg.clone(),
            },
        }
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            ProcessorError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
            ProcessorError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for ProcessorError {}

/// Trait for reporting processor errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a processor.
    fn report(&self, processor: &str, error: &ProcessorError);
}

/// Error reporter that writes to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, processor: &str, error: &ProcessorError) {
        if error.is_recoverable() {
            warn!(processor, %error, "processor error");
        } else {
            error!(processor, %error, "processor failed");
        }
    }
}
