//! A task owns one running pipeline for the lifetime of a session.
//!
//! The run loop reads both pipeline edges, listens to transport lifecycle
//! events and handle commands, and watches for idleness. Whatever ends the
//! session, teardown is the same: cancel, wait for every processor within the
//! grace period, abort the rest, publish the outcome.

mod events;
mod handle;
mod params;

pub use events::{PipelineEvent, StopReason};
pub use handle::{TaskHandle, TaskMetrics, TaskOutcome};
pub use params::TaskParams;

use crate::context::Message;
use crate::error::Result;
use crate::frames::{CancelReason, Frame, FrameKind, MetricsSample};
use crate::pipeline::error::ErrorReporter;
use crate::pipeline::metrics::{LatencyTracker, TurnTiming};
use crate::pipeline::orchestrator::{LinkedPipeline, Pipeline, PipelineHandle};
use crate::session::{SessionSignal, SessionState};
use crate::transport::TransportEvent;
use events::emit;
use handle::TaskCommand;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Far enough away that a disarmed idle timer never fires.
const NEVER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

pub struct PipelineTask {
    pipeline: LinkedPipeline,
    params: TaskParams,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    commands: mpsc::UnboundedReceiver<TaskCommand>,
    handle: TaskHandle,
    outcome_tx: watch::Sender<Option<TaskOutcome>>,
    state_tx: watch::Sender<SessionState>,
    metrics_tx: watch::Sender<TaskMetrics>,
}

impl PipelineTask {
    /// Links the pipeline. Frames can be queued through [`handle`](Self::handle)
    /// before [`run`](Self::run) is called.
    pub fn new(pipeline: Pipeline, params: TaskParams) -> Self {
        let pipeline = pipeline.link(params.queue_capacity);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (metrics_tx, metrics_rx) = watch::channel(TaskMetrics::default());
        let handle = TaskHandle::new(
            pipeline.entry(),
            commands_tx,
            outcome_rx,
            state_rx,
            metrics_rx,
        );

        Self {
            pipeline,
            params,
            transport_events: None,
            commands,
            handle,
            outcome_tx,
            state_tx,
            metrics_tx,
        }
    }

    /// Subscribes the task to a transport's lifecycle events.
    pub fn with_transport_events(mut self, events: mpsc::Receiver<TransportEvent>) -> Self {
        self.transport_events = Some(events);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.pipeline = self.pipeline.with_error_reporter(reporter);
        self
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    /// Runs the pipeline until it completes, is cancelled, times out idle or
    /// loses its client.
    pub async fn run(self) -> Result<TaskOutcome> {
        let PipelineTask {
            pipeline,
            params,
            mut transport_events,
            mut commands,
            handle,
            outcome_tx,
            state_tx,
            metrics_tx,
        } = self;

        let mut pipeline = pipeline.start();
        info!(
            idle_timeout = ?params.idle_timeout,
            metrics = params.enable_metrics,
            "pipeline task started"
        );

        let mut observer = SinkObserver::new(&params, state_tx, metrics_tx);
        let mut initial_prompt = params.initial_prompt.clone();
        let idle = params.idle_timeout;
        let idle_sleep = tokio::time::sleep(idle.unwrap_or(NEVER));
        tokio::pin!(idle_sleep);
        let mut sink_open = true;
        let mut source_open = true;

        let stop = loop {
            let (sink, source) = pipeline.edges();
            tokio::select! {
                biased;

                Some(command) = commands.recv() => match command {
                    TaskCommand::Cancel(reason) => {
                        info!(%reason, "cancel requested");
                        break StopReason::Cancelled(reason);
                    }
                    TaskCommand::Queued(count) => {
                        observer.metrics.frames_queued += count as u64;
                        observer.dirty = true;
                        if let Some(idle) = idle {
                            idle_sleep.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                    }
                },

                event = next_event(&mut transport_events), if transport_events.is_some() => {
                    match event {
                        Some(TransportEvent::ClientConnected { client_id }) => {
                            info!(%client_id, "client connected");
                            observer.signal(SessionSignal::Connected);
                            emit(&observer.event_tx, PipelineEvent::ClientConnected { client_id });
                            if let Some(prompt) = initial_prompt.take() {
                                seed_conversation(handle.clone(), prompt);
                            }
                        }
                        Some(TransportEvent::ClientDisconnected { client_id }) => {
                            info!(%client_id, "client disconnected");
                            break StopReason::Cancelled(CancelReason::ClientDisconnected);
                        }
                        Some(TransportEvent::Failed { message }) => {
                            warn!(%message, "transport failed");
                            break StopReason::Cancelled(CancelReason::TransportFailure { message });
                        }
                        None => {
                            debug!("transport event stream closed");
                            transport_events = None;
                        }
                    }
                }

                received = sink.recv(), if sink_open => match received {
                    Some((frame, _)) => {
                        if frame.is_activity()
                            && let Some(idle) = idle
                        {
                            idle_sleep.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                        match frame.kind() {
                            FrameKind::End => {
                                info!("pipeline completed");
                                break StopReason::Completed;
                            }
                            FrameKind::Cancel(reason) => {
                                info!(%reason, "cancel reached the sink");
                                break StopReason::Cancelled(reason.clone());
                            }
                            _ => observer.observe(&frame),
                        }
                    }
                    None => {
                        warn!("pipeline sink closed without End or Cancel");
                        sink_open = false;
                    }
                },

                received = source.recv(), if source_open => match received {
                    Some((frame, _)) => {
                        if let FrameKind::Cancel(reason) = frame.kind() {
                            info!(%reason, "cancel reached the source");
                            break StopReason::Cancelled(reason.clone());
                        }
                        debug!(frame = %frame.name(), "upstream frame left the pipeline");
                    }
                    None => source_open = false,
                },

                () = &mut idle_sleep, if idle.is_some() => {
                    warn!(timeout = ?idle, "no activity, cancelling session");
                    break StopReason::Cancelled(CancelReason::IdleTimeout);
                }
            }

            if !sink_open && !source_open {
                break StopReason::Cancelled(CancelReason::ProcessorFailure {
                    processor: "pipeline".to_string(),
                    message: "all pipeline edges closed".to_string(),
                });
            }

            observer.publish(&pipeline);
        };

        // Teardown
        if let StopReason::Cancelled(reason) = &stop {
            pipeline.cancel(reason.clone()).await;
        }
        let aborted = pipeline.join(params.cancel_grace).await;
        if !aborted.is_empty() {
            warn!(?aborted, "processors aborted after grace period");
        }
        let (sink, _) = pipeline.edges();
        let mut late = 0usize;
        while let Some((frame, _)) = sink.try_recv() {
            if !matches!(frame.kind(), FrameKind::Cancel(_) | FrameKind::End) {
                late += 1;
            }
        }
        if late > 0 {
            debug!(late, "discarded frames that reached the sink after stop");
        }

        observer.finish(&stop);
        observer.publish(&pipeline);
        if params.enable_metrics {
            observer.latency.log_summary();
        }
        emit(
            &observer.event_tx,
            PipelineEvent::Stopped {
                reason: stop.clone(),
            },
        );

        let outcome = TaskOutcome {
            reason: stop,
            aborted,
            metrics: observer.metrics.clone(),
        };
        outcome_tx.send_replace(Some(outcome.clone()));
        info!(reason = ?outcome.reason, "pipeline task finished");
        Ok(outcome)
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Queues the greeting turn without blocking the run loop on a full entry.
fn seed_conversation(handle: TaskHandle, prompt: String) {
    tokio::spawn(async move {
        let frames = vec![
            Frame::append_messages(vec![Message::user(prompt)]),
            Frame::run_trigger(),
        ];
        if let Err(e) = handle.queue_frames(frames).await {
            debug!("initial prompt not queued: {}", e);
        }
    });
}

/// Session bookkeeping driven by frames leaving the pipeline.
struct SinkObserver {
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    metrics_tx: watch::Sender<TaskMetrics>,
    event_tx: Option<crossbeam_channel::Sender<PipelineEvent>>,
    metrics: TaskMetrics,
    latency: LatencyTracker,
    track_latency: bool,
    turn_closed: Option<Instant>,
    first_response: Option<Instant>,
    response_audio: Duration,
    dirty: bool,
}

impl SinkObserver {
    fn new(
        params: &TaskParams,
        state_tx: watch::Sender<SessionState>,
        metrics_tx: watch::Sender<TaskMetrics>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            state_tx,
            metrics_tx,
            event_tx: params.event_tx.clone(),
            metrics: TaskMetrics::default(),
            latency: LatencyTracker::new(),
            track_latency: params.enable_metrics,
            turn_closed: None,
            first_response: None,
            response_audio: Duration::ZERO,
            dirty: false,
        }
    }

    fn signal(&mut self, signal: SessionSignal) {
        let next = self.state.next(signal);
        if next != self.state {
            debug!(from = %self.state, to = %next, "session state changed");
            emit(
                &self.event_tx,
                PipelineEvent::StateChanged {
                    from: self.state,
                    to: next,
                },
            );
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    fn observe(&mut self, frame: &Frame) {
        self.metrics.frames_out += 1;
        self.dirty = true;
        if let Some(signal) = SessionSignal::from_frame(frame) {
            self.signal(signal);
        }

        let now = Instant::now();
        match frame.kind() {
            FrameKind::SpeechStarted => emit(&self.event_tx, PipelineEvent::UserStartedSpeaking),
            FrameKind::SpeechStopped => emit(&self.event_tx, PipelineEvent::UserStoppedSpeaking),
            FrameKind::Interruption => {
                self.metrics.interruptions += 1;
                self.first_response = None;
                self.response_audio = Duration::ZERO;
                emit(&self.event_tx, PipelineEvent::Interrupted);
            }
            FrameKind::RunTrigger => {
                self.turn_closed = Some(now);
                self.first_response = None;
                self.response_audio = Duration::ZERO;
            }
            FrameKind::TextDelta(_) => {
                self.first_response.get_or_insert(now);
            }
            FrameKind::OutputAudio(chunk) => {
                self.first_response.get_or_insert(now);
                self.response_audio += chunk.duration();
            }
            FrameKind::ResponseCompleted => self.complete_turn(now),
            FrameKind::Metrics(MetricsSample::Ttfb { processor, value }) => {
                emit(
                    &self.event_tx,
                    PipelineEvent::Ttfb {
                        processor: processor.clone(),
                        ms: millis(*value),
                    },
                );
            }
            FrameKind::Metrics(MetricsSample::Usage {
                prompt_tokens,
                completion_tokens,
                ..
            }) => {
                self.metrics.prompt_tokens += prompt_tokens;
                self.metrics.completion_tokens += completion_tokens;
                emit(
                    &self.event_tx,
                    PipelineEvent::Usage {
                        prompt_tokens: *prompt_tokens,
                        completion_tokens: *completion_tokens,
                    },
                );
            }
            _ => {}
        }
    }

    fn complete_turn(&mut self, now: Instant) {
        self.metrics.turns += 1;
        let timing = match (self.turn_closed.take(), self.first_response.take()) {
            (Some(turn_closed), Some(first_response)) => Some(TurnTiming {
                turn_closed,
                first_response,
                completed: now,
                response_audio: std::mem::take(&mut self.response_audio),
            }),
            _ => None,
        };

        emit(
            &self.event_tx,
            PipelineEvent::TurnCompleted {
                turn: self.metrics.turns,
                response_latency_ms: timing.as_ref().map(|t| millis(t.response_latency())),
                total_latency_ms: timing.as_ref().map(|t| millis(t.total_latency())),
            },
        );
        if self.track_latency
            && let Some(timing) = timing
        {
            self.latency.record(timing);
        }
    }

    fn finish(&mut self, stop: &StopReason) {
        let signal = match stop {
            StopReason::Completed
            | StopReason::Cancelled(CancelReason::ClientDisconnected)
            | StopReason::Cancelled(CancelReason::TransportFailure { .. }) => {
                SessionSignal::Disconnected
            }
            StopReason::Cancelled(_) => SessionSignal::Cancelled,
        };
        self.signal(signal);
        self.dirty = true;
    }

    /// Pushes a metrics snapshot to handles when something changed.
    fn publish(&mut self, pipeline: &PipelineHandle) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.metrics.dropped_frames = pipeline.dropped_frames();
        self.metrics.processors = pipeline.stats();
        self.metrics.latency = self.latency.stats();
        self.metrics_tx.send_replace(self.metrics.clone());
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
