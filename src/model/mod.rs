//! Conversational model capability and the processor that drives it.
//!
//! A [`ModelBackend`] is stateless across runs: every [`RunRequest`] carries
//! the full conversation history. The [`ModelProcessor`] starts a run on each
//! `RunTrigger` and streams the backend's [`ResponseEvent`]s back into the
//! pipeline as frames.

pub mod mock;

pub use mock::{EchoBackend, ScriptedBackend};

use crate::context::{ContextHandle, Message, Role};
use crate::error;
use crate::frames::{
    AudioChunk, CancelReason, Frame, FrameDirection, FrameKind, MetricsSample,
};
use crate::pipeline::error::ProcessorError;
use crate::pipeline::processor::{FrameEmitter, Outbox, Processor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Input for one model run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub system_instruction: Option<String>,
    /// Full conversation history, oldest first.
    pub messages: Vec<Message>,
}

impl RunRequest {
    pub fn new(system_instruction: Option<String>, messages: Vec<Message>) -> Self {
        Self {
            system_instruction,
            messages,
        }
    }

    /// History with the system instruction prepended as a system message.
    pub fn full_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(instruction) = &self.system_instruction {
            messages.push(Message::system(instruction.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
    }
}

/// One event in a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Started,
    TextDelta(String),
    Audio(AudioChunk),
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Completed,
    /// The backend failed mid-stream.
    Error(String),
}

/// Receiving end of a model response.
pub type ResponseStream = mpsc::Receiver<ResponseEvent>;

/// A conversational model: accepts a full context, streams back a response.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Starts a run. Dropping the returned stream abandons it.
    async fn run(&self, request: RunRequest) -> error::Result<ResponseStream>;

    /// Realtime audio input for backends that listen directly.
    async fn send_audio(&self, _chunk: &AudioChunk) -> error::Result<()> {
        Ok(())
    }
}

/// Implement ModelBackend for Arc<T> so tests can keep a handle to the backend.
#[async_trait]
impl<T: ModelBackend> ModelBackend for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(&self, request: RunRequest) -> error::Result<ResponseStream> {
        (**self).run(request).await
    }

    async fn send_audio(&self, chunk: &AudioChunk) -> error::Result<()> {
        (**self).send_audio(chunk).await
    }
}

/// Pipeline stage adapting a [`ModelBackend`].
pub struct ModelProcessor {
    backend: Box<dyn ModelBackend>,
    context: ContextHandle,
    system_instruction: Option<String>,
    enable_metrics: bool,
    enable_usage_metrics: bool,
    emitter: Option<FrameEmitter>,
    in_flight: Option<JoinHandle<()>>,
}

impl ModelProcessor {
    pub fn new(backend: impl ModelBackend, context: ContextHandle) -> Self {
        Self {
            backend: Box::new(backend),
            context,
            system_instruction: None,
            enable_metrics: false,
            enable_usage_metrics: false,
            emitter: None,
            in_flight: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Emit time-to-first-byte and processing-time samples.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Emit token usage samples reported by the backend.
    pub fn with_usage_metrics(mut self, enabled: bool) -> Self {
        self.enable_usage_metrics = enabled;
        self
    }

    fn abort_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    async fn start_run(&mut self, trigger: Frame) -> Result<(), ProcessorError> {
        let Some(emitter) = self.emitter.clone() else {
            return Err(ProcessorError::Fatal("model processor not started".to_string()));
        };
        if self.abort_in_flight() {
            debug!(backend = self.backend.name(), "new run supersedes in-flight response");
        }

        let request = RunRequest::new(self.system_instruction.clone(), self.context.snapshot());
        let started = Instant::now();

        // The trigger must leave before any response frame from the stream.
        if emitter.push(trigger, FrameDirection::Downstream).await.is_err() {
            if emitter.is_cancelled() {
                return Ok(());
            }
            return Err(ProcessorError::Fatal(
                "link to neighboring processor closed".to_string(),
            ));
        }

        debug!(
            backend = self.backend.name(),
            messages = request.messages.len(),
            "starting model run"
        );
        let stream = self
            .backend
            .run(request)
            .await
            .map_err(|e| ProcessorError::Backend(e.to_string()))?;

        let forwarder = ResponseForwarder {
            emitter,
            started,
            enable_metrics: self.enable_metrics,
            enable_usage_metrics: self.enable_usage_metrics,
            sent_started: false,
            sent_first: false,
        };
        self.in_flight = Some(tokio::spawn(forwarder.run(stream)));
        Ok(())
    }
}

#[async_trait]
impl Processor for ModelProcessor {
    fn name(&self) -> &str {
        "model"
    }

    async fn start(&mut self, emitter: &FrameEmitter) -> Result<(), ProcessorError> {
        self.emitter = Some(emitter.clone());
        info!(backend = self.backend.name(), "model processor ready");
        Ok(())
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        if direction == FrameDirection::Upstream {
            out.forward(frame, direction);
            return Ok(());
        }

        match frame.kind() {
            FrameKind::RunTrigger => return self.start_run(frame).await,
            FrameKind::InputAudio(chunk) => {
                self.backend
                    .send_audio(chunk)
                    .await
                    .map_err(|e| ProcessorError::Backend(e.to_string()))?;
            }
            FrameKind::Interruption => {
                if self.abort_in_flight() {
                    info!(backend = self.backend.name(), "response interrupted");
                }
            }
            _ => {}
        }
        out.forward(frame, direction);
        Ok(())
    }

    async fn on_end(&mut self, _out: &mut Outbox) -> Result<(), ProcessorError> {
        // Let the current response finish streaming before End follows it.
        if let Some(handle) = self.in_flight.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "response forwarder did not finish");
        }
        Ok(())
    }

    async fn on_cancel(&mut self, reason: &CancelReason) {
        if self.abort_in_flight() {
            debug!(%reason, "in-flight response abandoned");
        }
    }

    async fn shutdown(&mut self) {
        self.abort_in_flight();
    }
}

/// Turns one response stream into frames.
struct ResponseForwarder {
    emitter: FrameEmitter,
    started: Instant,
    enable_metrics: bool,
    enable_usage_metrics: bool,
    sent_started: bool,
    sent_first: bool,
}

impl ResponseForwarder {
    async fn run(mut self, mut stream: ResponseStream) {
        while let Some(event) = stream.recv().await {
            let (frames, done) = self.translate(event);
            for frame in frames {
                if self.emitter.push(frame, FrameDirection::Downstream).await.is_err() {
                    debug!("response dropped, downstream closed");
                    return;
                }
            }
            if done {
                return;
            }
        }
        self.emitter.fail(ProcessorError::Backend(
            "response stream ended before completion".to_string(),
        ));
    }

    fn translate(&mut self, event: ResponseEvent) -> (Vec<Frame>, bool) {
        let mut frames = Vec::new();
        let processor = self.emitter.processor().to_string();
        match event {
            ResponseEvent::Started => self.ensure_started(&mut frames),
            ResponseEvent::TextDelta(text) => {
                self.ensure_started(&mut frames);
                self.first_byte(&mut frames);
                frames.push(Frame::text_delta(text));
            }
            ResponseEvent::Audio(chunk) => {
                self.ensure_started(&mut frames);
                self.first_byte(&mut frames);
                frames.push(Frame::output_audio(chunk));
            }
            ResponseEvent::Usage {
                prompt_tokens,
                completion_tokens,
            } => {
                if self.enable_usage_metrics {
                    frames.push(Frame::metrics(MetricsSample::Usage {
                        processor,
                        prompt_tokens,
                        completion_tokens,
                    }));
                }
            }
            ResponseEvent::Completed => {
                self.ensure_started(&mut frames);
                if self.enable_metrics {
                    frames.push(Frame::metrics(MetricsSample::Processing {
                        processor,
                        value: self.started.elapsed(),
                    }));
                }
                frames.push(Frame::new(FrameKind::ResponseCompleted));
                return (frames, true);
            }
            ResponseEvent::Error(message) => {
                self.emitter.fail(ProcessorError::Backend(message));
                return (frames, true);
            }
        }
        (frames, false)
    }

    fn ensure_started(&mut self, frames: &mut Vec<Frame>) {
        if !self.sent_started {
            self.sent_started = true;
            frames.push(Frame::new(FrameKind::ResponseStarted));
        }
    }

    fn first_byte(&mut self, frames: &mut Vec<Frame>) {
        if self.sent_first {
            return;
        }
        self.sent_first = true;
        let ttfb = self.started.elapsed();
        debug!(ttfb_ms = ttfb.as_millis() as u64, "first response byte");
        if self.enable_metrics {
            frames.push(Frame::metrics(MetricsSample::Ttfb {
                processor: self.emitter.processor().to_string(),
                value: ttfb,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ProcessorHarness;
    use std::time::Duration;

    fn processor(backend: ScriptedBackend, context: &ContextHandle) -> ModelProcessor {
        ModelProcessor::new(backend, context.clone())
    }

    fn without_metrics(kinds: Vec<FrameKind>) -> Vec<FrameKind> {
        kinds
            .into_iter()
            .filter(|k| !matches!(k, FrameKind::Metrics(_)))
            .collect()
    }

    #[test]
    fn test_run_request_full_messages() {
        let request = RunRequest::new(
            Some("Be brief".to_string()),
            vec![Message::user("Hello"), Message::assistant("Hi")],
        );
        let full = request.full_messages();
        assert_eq!(full.len(), 3);
        assert_eq!(full[0], Message::system("Be brief"));
        assert_eq!(request.last_user_text(), Some("Hello".to_string()));
    }

    #[test]
    fn test_run_request_without_instruction() {
        let request = RunRequest::new(None, vec![Message::assistant("Hi")]);
        assert_eq!(request.full_messages().len(), 1);
        assert_eq!(request.last_user_text(), None);
    }

    #[tokio::test]
    async fn test_run_streams_response_after_trigger() {
        let context = ContextHandle::new();
        context.append(Message::user("Hello"));
        let backend = Arc::new(ScriptedBackend::new().with_reply("Hi there"));
        let mut harness = ProcessorHarness::start(
            ModelProcessor::new(backend.clone(), context.clone())
                .with_system_instruction("Be brief"),
        );

        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(
            kinds,
            vec![
                FrameKind::RunTrigger,
                FrameKind::ResponseStarted,
                FrameKind::TextDelta("Hi ".to_string()),
                FrameKind::TextDelta("there".to_string()),
                FrameKind::ResponseCompleted,
                FrameKind::End,
            ]
        );

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system_instruction.as_deref(), Some("Be brief"));
        assert_eq!(requests[0].messages, vec![Message::user("Hello")]);
    }

    #[tokio::test]
    async fn test_metrics_emitted_when_enabled() {
        let context = ContextHandle::new();
        let backend = ScriptedBackend::new()
            .with_reply("ok")
            .with_usage(12, 3);
        let mut harness = ProcessorHarness::start(
            processor(backend, &context)
                .with_metrics(true)
                .with_usage_metrics(true),
        );

        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        let samples: Vec<&MetricsSample> = kinds
            .iter()
            .filter_map(|k| match k {
                FrameKind::Metrics(sample) => Some(sample),
                _ => None,
            })
            .collect();
        assert!(samples.iter().any(|s| matches!(s, MetricsSample::Ttfb { .. })));
        assert!(samples.iter().any(|s| matches!(s, MetricsSample::Processing { .. })));
        assert!(samples.iter().any(|s| matches!(
            s,
            MetricsSample::Usage {
                prompt_tokens: 12,
                completion_tokens: 3,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_no_metrics_by_default() {
        let context = ContextHandle::new();
        let mut harness =
            ProcessorHarness::start(processor(ScriptedBackend::new().with_reply("ok"), &context));
        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(without_metrics(kinds.clone()), kinds);
    }

    #[tokio::test]
    async fn test_backend_failure_cancels_with_backend_reason() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(processor(
            ScriptedBackend::new().with_failure("quota exceeded"),
            &context,
        ));

        harness.send(Frame::run_trigger()).await;
        let kinds = harness.collect_downstream().await;
        match kinds.last() {
            Some(FrameKind::Cancel(CancelReason::BackendFailure { processor, message })) => {
                assert_eq!(processor, "model");
                assert!(message.contains("quota exceeded"), "got: {}", message);
            }
            other => panic!("expected backend cancel, got {:?}", other),
        }
        harness.join().await;
    }

    #[tokio::test]
    async fn test_stream_error_mid_response_cancels() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(processor(
            ScriptedBackend::new().with_stream_failure("Hel", "connection reset"),
            &context,
        ));

        harness.send(Frame::run_trigger()).await;
        let kinds = harness.collect_downstream().await;
        assert!(!kinds.contains(&FrameKind::ResponseCompleted));
        assert!(matches!(
            kinds.last(),
            Some(FrameKind::Cancel(CancelReason::BackendFailure { .. }))
        ));
        harness.join().await;
    }

    #[tokio::test]
    async fn test_interruption_aborts_in_flight_run() {
        let context = ContextHandle::new();
        let backend = ScriptedBackend::new()
            .with_reply("this reply never finishes")
            .with_hang();
        let mut harness = ProcessorHarness::start(processor(backend, &context));

        harness.send(Frame::run_trigger()).await;
        // Wait until the response is streaming.
        loop {
            let (frame, _) = harness.downstream.recv().await.unwrap();
            if matches!(frame.kind(), FrameKind::TextDelta(_)) {
                break;
            }
        }
        harness.send(FrameKind::Interruption.into()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert!(kinds.contains(&FrameKind::Interruption));
        assert!(!kinds.contains(&FrameKind::ResponseCompleted));
        assert_eq!(kinds.last(), Some(&FrameKind::End));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_run() {
        let context = ContextHandle::new();
        let backend = ScriptedBackend::new()
            .with_reply("slow reply")
            .with_delta_delay(Duration::from_secs(60));
        let mut harness = ProcessorHarness::start(processor(backend, &context));

        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::cancel(CancelReason::Requested)).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(kinds.last(), Some(&FrameKind::Cancel(CancelReason::Requested)));
        assert!(!kinds.contains(&FrameKind::ResponseCompleted));
        harness.join().await;
    }

    #[tokio::test]
    async fn test_input_audio_reaches_backend() {
        let context = ContextHandle::new();
        let backend = Arc::new(ScriptedBackend::new());
        let mut harness =
            ProcessorHarness::start(ModelProcessor::new(backend.clone(), context.clone()));

        for _ in 0..3 {
            harness
                .send(Frame::input_audio(AudioChunk::new(vec![0; 320], 16000)))
                .await;
        }
        harness.send(Frame::end()).await;
        let kinds = harness.collect_downstream().await;
        assert_eq!(kinds.len(), 4);
        assert_eq!(backend.audio_chunks(), 3);
    }
}
