use crate::config::Config;
use crate::defaults;
use crate::task::events::PipelineEvent;
use std::time::Duration;

/// Knobs for one task run.
#[derive(Debug, Clone)]
pub struct TaskParams {
    /// Record per-turn latency and log a summary at the end.
    pub enable_metrics: bool,
    /// Ask the model processor to report token usage.
    pub enable_usage_metrics: bool,
    /// Whether user speech may interrupt a response.
    pub allow_interruptions: bool,
    /// Cancel the session after this long without activity. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// How long teardown waits for processors before aborting them.
    pub cancel_grace: Duration,
    pub queue_capacity: usize,
    /// Seeded as a user message when a client connects.
    pub initial_prompt: Option<String>,
    pub event_tx: Option<crossbeam_channel::Sender<PipelineEvent>>,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_usage_metrics: false,
            allow_interruptions: true,
            idle_timeout: Some(Duration::from_secs(defaults::IDLE_TIMEOUT_SECS)),
            cancel_grace: Duration::from_secs(defaults::CANCEL_GRACE_SECS),
            queue_capacity: defaults::QUEUE_CAPACITY,
            initial_prompt: Some(defaults::INITIAL_PROMPT.to_string()),
            event_tx: None,
        }
    }
}

impl TaskParams {
    pub fn from_config(config: &Config) -> Self {
        let idle_timeout = match config.session.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let initial_prompt = Some(config.session.initial_prompt.trim())
            .filter(|prompt| !prompt.is_empty())
            .map(str::to_string);

        Self {
            enable_metrics: config.pipeline.enable_metrics,
            enable_usage_metrics: config.pipeline.enable_usage_metrics,
            allow_interruptions: config.pipeline.allow_interruptions,
            idle_timeout,
            cancel_grace: Duration::from_secs(config.session.cancel_grace_secs),
            queue_capacity: config.pipeline.queue_capacity,
            initial_prompt,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: crossbeam_channel::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}
