//! Error types for vocalink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VocalinkError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Pipeline errors
    #[error("Processor {processor} failed: {message}")]
    ProcessorFailure { processor: String, message: String },

    #[error("Model backend {backend} failed: {message}")]
    BackendFailure { backend: String, message: String },

    #[error("Transport failed: {message}")]
    TransportFailure { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Pipeline is closed: {message}")]
    PipelineClosed { message: String },

    // Audio errors
    #[error("Audio format error: {message}")]
    AudioFormat { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VocalinkError>;
