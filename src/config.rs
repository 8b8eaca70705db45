use crate::audio::vad::VadConfig;
use crate::defaults;
use crate::error::{Result, VocalinkError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub vad: VadConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
}

/// Session lifetime and conversation seeding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds without activity before the session is cancelled. 0 disables.
    pub idle_timeout_secs: u64,
    pub cancel_grace_secs: u64,
    /// System-role content prepended to every model run.
    pub system_instruction: String,
    /// Seeded as a user message when a client connects. Empty disables.
    pub initial_prompt: String,
}

/// Pipeline runtime behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub allow_interruptions: bool,
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: defaults::IDLE_TIMEOUT_SECS,
            cancel_grace_secs: defaults::CANCEL_GRACE_SECS,
            system_instruction: defaults::SYSTEM_INSTRUCTION.to_string(),
            initial_prompt: defaults::INITIAL_PROMPT.to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_usage_metrics: false,
            allow_interruptions: true,
            queue_capacity: defaults::QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOCALINK_VAD_THRESHOLD → vad.threshold
    /// - VOCALINK_VAD_STOP_SECS → vad.stop_secs
    /// - VOCALINK_IDLE_TIMEOUT_SECS → session.idle_timeout_secs
    /// - VOCALINK_SYSTEM_INSTRUCTION → session.system_instruction
    /// - VOCALINK_ENABLE_METRICS → pipeline.enable_metrics
    ///
    /// Empty or unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(threshold) = env_parse("VOCALINK_VAD_THRESHOLD") {
            self.vad.threshold = threshold;
        }

        if let Some(stop_secs) = env_parse("VOCALINK_VAD_STOP_SECS") {
            self.vad.stop_secs = stop_secs;
        }

        if let Some(timeout) = env_parse("VOCALINK_IDLE_TIMEOUT_SECS") {
            self.session.idle_timeout_secs = timeout;
        }

        if let Ok(instruction) = std::env::var("VOCALINK_SYSTEM_INSTRUCTION")
            && !instruction.is_empty()
        {
            self.session.system_instruction = instruction;
        }

        if let Some(enabled) = env_parse("VOCALINK_ENABLE_METRICS") {
            self.pipeline.enable_metrics = enabled;
        }

        self
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(invalid("vad.threshold", "must be between 0.0 and 1.0"));
        }
        if !self.vad.start_secs.is_finite() || self.vad.start_secs < 0.0 {
            return Err(invalid("vad.start_secs", "must be zero or positive"));
        }
        if !self.vad.stop_secs.is_finite() || self.vad.stop_secs <= 0.0 {
            return Err(invalid("vad.stop_secs", "must be positive"));
        }
        if self.vad.start_secs > defaults::MAX_VAD_WINDOW_SECS {
            return Err(invalid("vad.start_secs", "must be at most 60 seconds"));
        }
        if self.vad.stop_secs > defaults::MAX_VAD_WINDOW_SECS {
            return Err(invalid("vad.stop_secs", "must be at most 60 seconds"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(invalid("pipeline.queue_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/vocalink/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vocalink")
            .join("config.toml")
    }

    /// Look up a value by dotted key, e.g. `vad.stop_secs`.
    pub fn get_value_by_path(&self, key: &str) -> Result<String> {
        let root = toml::Value::try_from(self).map_err(|e| VocalinkError::ConfigParse {
            message: e.to_string(),
        })?;
        let mut current = &root;
        for part in key.split('.') {
            current = current
                .get(part)
                .ok_or_else(|| invalid(key, "unknown configuration key"))?;
        }
        Ok(match current {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Commented template with every option at its default.
    pub fn dump_template() -> String {
        format!(
            r#"# vocalink configuration
# Location: {path}

[vad]
# Speech probability at or above which a chunk counts as speech (0.0-1.0)
threshold = {threshold}
# Speech must persist this long before the user is considered speaking
start_secs = {start_secs}
# Silence that ends the user's turn
stop_secs = {stop_secs}

[session]
# Cancel the session after this many seconds without activity (0 disables)
idle_timeout_secs = {idle}
# Seconds teardown waits for processors before aborting them
cancel_grace_secs = {grace}
# Seeded as a user message when a client connects (empty disables)
initial_prompt = "{prompt}"
# system_instruction = "..."

[pipeline]
enable_metrics = false
enable_usage_metrics = false
# Whether user speech interrupts a response in progress
allow_interruptions = true
# Frames buffered per link before senders wait
queue_capacity = {capacity}
"#,
            path = Self::default_path().display(),
            threshold = defaults::VAD_THRESHOLD,
            start_secs = defaults::VAD_START_SECS,
            stop_secs = defaults::VAD_STOP_SECS,
            idle = defaults::IDLE_TIMEOUT_SECS,
            grace = defaults::CANCEL_GRACE_SECS,
            prompt = defaults::INITIAL_PROMPT,
            capacity = defaults::QUEUE_CAPACITY,
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .and_then(|value| value.trim().parse().ok())
}

fn invalid(key: &str, message: &str) -> VocalinkError {
    VocalinkError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
