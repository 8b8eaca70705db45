//! Assembles the standard voice conversation pipeline.
//!
//! transport input → VAD → user aggregator → model → assistant aggregator →
//! transport output

use crate::audio::vad::{SpeechAnalyzer, VadConfig};
use crate::config::Config;
use crate::context::{ContextAggregatorPair, ContextHandle};
use crate::error::Result;
use crate::model::{ModelBackend, ModelProcessor};
use crate::pipeline::orchestrator::Pipeline;
use crate::pipeline::processor::Processor;
use crate::pipeline::vad_processor::VadProcessor;
use crate::task::{PipelineTask, TaskParams};
use crate::transport::{Transport, TransportEvent};
use tokio::sync::mpsc;

pub struct ConversationBuilder<B> {
    backend: B,
    vad: VadConfig,
    analyzer: Option<Box<dyn SpeechAnalyzer>>,
    system_instruction: Option<String>,
    context: ContextHandle,
}

impl<B: ModelBackend> ConversationBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            vad: VadConfig::default(),
            analyzer: None,
            system_instruction: None,
            context: ContextHandle::new(),
        }
    }

    /// VAD settings and system instruction taken from `config`.
    pub fn from_config(backend: B, config: &Config) -> Self {
        let instruction = config.session.system_instruction.trim();
        let builder = Self::new(backend).with_vad(config.vad);
        if instruction.is_empty() {
            builder
        } else {
            builder.with_system_instruction(instruction)
        }
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    /// Replaces the default RMS speech analyzer.
    pub fn with_analyzer(mut self, analyzer: Box<dyn SpeechAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Continue an existing conversation instead of starting empty.
    pub fn with_context(mut self, context: ContextHandle) -> Self {
        self.context = context;
        self
    }

    /// Takes the transport's processors and event stream and wires the
    /// pipeline around them.
    pub fn build(self, transport: &mut dyn Transport, params: &TaskParams) -> Result<Conversation> {
        let input = transport.input()?;
        let output = transport.output()?;
        let events = transport.events();

        let vad = match self.analyzer {
            Some(analyzer) => VadProcessor::with_analyzer(self.vad, analyzer),
            None => VadProcessor::new(self.vad),
        };
        let aggregators = ContextAggregatorPair::new(self.context.clone())
            .with_interruptions(params.allow_interruptions);
        let mut model = ModelProcessor::new(self.backend, self.context.clone())
            .with_metrics(params.enable_metrics)
            .with_usage_metrics(params.enable_usage_metrics);
        if let Some(instruction) = self.system_instruction {
            model = model.with_system_instruction(instruction);
        }

        let processors: Vec<Box<dyn Processor>> = vec![
            input,
            Box::new(vad),
            Box::new(aggregators.user()),
            Box::new(model),
            Box::new(aggregators.assistant()),
            output,
        ];

        Ok(Conversation {
            pipeline: Pipeline::new(processors),
            context: self.context,
            events,
        })
    }
}

/// A wired but not yet running conversation.
pub struct Conversation {
    pub pipeline: Pipeline,
    /// Shared with both aggregators; read-only for everyone else.
    pub context: ContextHandle,
    pub events: Option<mpsc::Receiver<TransportEvent>>,
}

impl Conversation {
    /// Wraps the pipeline in a task subscribed to the transport's events.
    pub fn into_task(self, params: TaskParams) -> (PipelineTask, ContextHandle) {
        let task = PipelineTask::new(self.pipeline, params);
        let task = match self.events {
            Some(events) => task.with_transport_events(events),
            None => task,
        };
        (task, self.context)
    }
}
