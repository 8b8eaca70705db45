//! Pipeline wiring: processor i's downstream output feeds processor i+1's
//! inbox, and each processor's upstream output feeds processor i-1's inbox.
//!
//! Frames leaving the last processor downstream land on the sink link;
//! frames leaving the first processor upstream land on the source link.
//! Both edges are read by whoever owns the [`PipelineHandle`].

use crate::frames::{CancelReason, Frame, FrameDirection};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::link::{LinkReceiver, LinkSender, link_with_counter};
use crate::pipeline::metrics::{ProcessorCounters, ProcessorStats};
use crate::pipeline::processor::{FrameEmitter, Processor, ProcessorRunner};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An ordered chain of processors that has not been started yet.
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl Pipeline {
    /// Creates a new pipeline with the default error reporter.
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self {
            processors,
            error_reporter: Arc::new(LogReporter),
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Processor names, head first.
    pub fn names(&self) -> Vec<String> {
        self.processors.iter().map(|p| p.name().to_string()).collect()
    }

    /// Creates every link. Nothing runs until [`LinkedPipeline::start`].
    pub fn link(self, queue_capacity: usize) -> LinkedPipeline {
        let dropped = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let (sink_tx, sink) = link_with_counter(queue_capacity, dropped.clone());
        let (source_tx, source) = link_with_counter(queue_capacity, dropped.clone());

        let inboxes: Vec<(LinkSender, LinkReceiver)> = self
            .processors
            .iter()
            .map(|_| link_with_counter(queue_capacity, dropped.clone()))
            .collect();
        let senders: Vec<LinkSender> = inboxes.iter().map(|(tx, _)| tx.clone()).collect();
        let entry = senders.first().cloned().unwrap_or_else(|| sink_tx.clone());

        let count = self.processors.len();
        let mut stages = Vec::with_capacity(count);
        for (index, (processor, (own, inbox))) in
            self.processors.into_iter().zip(inboxes).enumerate()
        {
            let downstream = senders.get(index + 1).cloned().unwrap_or_else(|| sink_tx.clone());
            let upstream = if index == 0 {
                source_tx.clone()
            } else {
                senders[index - 1].clone()
            };
            let emitter =
                FrameEmitter::new(processor.name(), downstream, upstream, own, cancel.clone());
            let counters = Arc::new(ProcessorCounters::new(processor.name()));
            stages.push(Stage {
                processor,
                inbox,
                emitter,
                counters,
            });
        }

        LinkedPipeline {
            entry,
            sink,
            source,
            cancel,
            dropped,
            stages,
            error_reporter: self.error_reporter,
        }
    }
}

struct Stage {
    processor: Box<dyn Processor>,
    inbox: LinkReceiver,
    emitter: FrameEmitter,
    counters: Arc<ProcessorCounters>,
}

/// A pipeline whose links exist but whose processors are not running.
///
/// Frames can already be queued at the entry; they wait there until start.
pub struct LinkedPipeline {
    entry: LinkSender,
    sink: LinkReceiver,
    source: LinkReceiver,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    stages: Vec<Stage>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl LinkedPipeline {
    /// Sender feeding the head of the pipeline.
    pub fn entry(&self) -> LinkSender {
        self.entry.clone()
    }

    /// Replaces the error reporter before any processor starts.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Spawns one runner per processor. Must be called inside a tokio runtime.
    pub fn start(self) -> PipelineHandle {
        let mut runners = Vec::with_capacity(self.stages.len());
        let mut counters = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            counters.push(stage.counters.clone());
            runners.push(ProcessorRunner::spawn(
                stage.processor,
                stage.inbox,
                stage.emitter,
                self.error_reporter.clone(),
                stage.counters,
            ));
        }
        debug!(processors = runners.len(), "pipeline started");

        PipelineHandle {
            entry: self.entry,
            sink: self.sink,
            source: self.source,
            cancel: self.cancel,
            dropped: self.dropped,
            runners,
            counters,
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    entry: LinkSender,
    sink: LinkReceiver,
    source: LinkReceiver,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    runners: Vec<ProcessorRunner>,
    counters: Vec<Arc<ProcessorCounters>>,
}

impl PipelineHandle {
    pub fn entry(&self) -> &LinkSender {
        &self.entry
    }

    /// The sink and source edges, borrowed together so both can be awaited.
    pub fn edges(&mut self) -> (&mut LinkReceiver, &mut LinkReceiver) {
        (&mut self.sink, &mut self.source)
    }

    /// Begins teardown: blocked sends give up and a Cancel enters at the head.
    pub async fn cancel(&self, reason: CancelReason) {
        self.cancel.cancel();
        if self
            .entry
            .send(Frame::cancel(reason), FrameDirection::Downstream)
            .await
            .is_err()
        {
            debug!("pipeline head already stopped");
        }
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of processors that have not stopped yet.
    pub fn running(&self) -> usize {
        self.runners.iter().filter(|r| !r.is_finished()).count()
    }

    /// Waits for every processor to stop, aborting those still running once
    /// `grace` has elapsed. Returns the names of aborted processors.
    pub async fn join(&mut self, grace: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = Vec::new();

        for runner in self.runners.drain(..) {
            let name = runner.name().to_string();
            let abort = runner.abort_handle();
            match tokio::time::timeout_at(deadline, runner.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => warn!(processor = %name, "{}", message),
                Err(_) => {
                    abort.abort();
                    warn!(processor = %name, "processor did not stop within grace period, aborting");
                    aborted.push(name);
                }
            }
        }

        aborted
    }

    pub fn stats(&self) -> Vec<ProcessorStats> {
        self.counters.iter().map(|c| c.snapshot()).collect()
    }

    /// Droppable frames discarded on full links.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
