//! Processor abstraction and the runner that drives one processor.
//!
//! Every processor runs in its own tokio task and owns its inbound link.
//! The runner, not the processor, handles the lifecycle frames: `End` is
//! flushed through [`Processor::on_end`] and forwarded, `Cancel` goes through
//! [`Processor::on_cancel`] and is forwarded in the direction it arrived.
//! Handler errors and panics stop at the runner and turn into Cancel frames
//! sent both ways, so a dead processor never leaves its neighbors waiting.

use crate::frames::{CancelReason, Frame, FrameDirection, FrameKind};
use crate::pipeline::error::{ErrorReporter, ProcessorError};
use crate::pipeline::link::{Inbound, LinkClosed, LinkReceiver, LinkSender};
use crate::pipeline::metrics::ProcessorCounters;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A stage of the pipeline.
///
/// Frames a processor does not consume must be forwarded explicitly through
/// the [`Outbox`]; the runner never forwards on its behalf except for `End`
/// and `Cancel`.
#[async_trait]
pub trait Processor: Send + 'static {
    /// Returns the name of this processor for logging and error reporting.
    fn name(&self) -> &str;

    /// Called once before the first frame. Processors that produce frames on
    /// their own (transport input, model streaming) keep a clone of the emitter.
    async fn start(&mut self, _emitter: &FrameEmitter) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Handles a single frame, pushing zero or more outgoing frames.
    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError>;

    /// Called when `End` arrives. Frames pushed here go out before `End`.
    async fn on_end(&mut self, _out: &mut Outbox) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Called when `Cancel` arrives or the processor fails. Release held
    /// resources; pending buffers are discarded, never flushed.
    async fn on_cancel(&mut self, _reason: &CancelReason) {}

    /// Called when the runner stops, whatever the reason.
    async fn shutdown(&mut self) {}
}

/// Outgoing frames produced by one handler call.
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<(Frame, FrameDirection)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame travelling downstream.
    pub fn push(&mut self, frame: impl Into<Frame>) {
        self.frames.push((frame.into(), FrameDirection::Downstream));
    }

    /// Queue a frame travelling upstream.
    pub fn push_upstream(&mut self, frame: impl Into<Frame>) {
        self.frames.push((frame.into(), FrameDirection::Upstream));
    }

    /// Pass a frame on in the direction it was travelling.
    pub fn forward(&mut self, frame: Frame, direction: FrameDirection) {
        self.frames.push((frame, direction));
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[(Frame, FrameDirection)] {
        &self.frames
    }

    /// Kinds of the queued frames, in order.
    pub fn kinds(&self) -> Vec<&FrameKind> {
        self.frames.iter().map(|(frame, _)| frame.kind()).collect()
    }

    pub fn into_frames(self) -> Vec<(Frame, FrameDirection)> {
        self.frames
    }

    fn drain(&mut self) -> std::vec::Drain<'_, (Frame, FrameDirection)> {
        self.frames.drain(..)
    }
}

/// Handle for pushing frames from outside a handler call.
///
/// Pushes respect backpressure like the runner's own sends, but give up once
/// the pipeline is being torn down.
#[derive(Debug, Clone)]
pub struct FrameEmitter {
    processor: Arc<str>,
    downstream: LinkSender,
    upstream: LinkSender,
    own: LinkSender,
    cancel: CancellationToken,
}

impl FrameEmitter {
    pub(crate) fn new(
        processor: &str,
        downstream: LinkSender,
        upstream: LinkSender,
        own: LinkSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            processor: Arc::from(processor),
            downstream,
            upstream,
            own,
            cancel,
        }
    }

    /// Name of the processor that owns this emitter.
    pub fn processor(&self) -> &str {
        &self.processor
    }

    /// Push a frame to the neighbor in `direction`.
    pub async fn push(&self, frame: Frame, direction: FrameDirection) -> Result<(), LinkClosed> {
        let target = match direction {
            FrameDirection::Downstream => &self.downstream,
            FrameDirection::Upstream => &self.upstream,
        };
        tokio::select! {
            biased;
            result = target.send(frame, direction) => result,
            () = self.cancel.cancelled() => Err(LinkClosed),
        }
    }

    /// Queue a frame on the owning processor's own inbox, behind anything
    /// already waiting there. Sources use this so their frames, and their
    /// final `End`, pass through the runner like any other input.
    pub async fn push_inbound(&self, frame: Frame) -> Result<(), LinkClosed> {
        tokio::select! {
            biased;
            result = self.own.send(frame, FrameDirection::Downstream) => result,
            () = self.cancel.cancelled() => Err(LinkClosed),
        }
    }

    /// Report a failure to the owning runner, which handles it exactly like
    /// an error returned from a handler.
    pub fn fail(&self, error: ProcessorError) {
        if self.own.send_failure(error).is_err() {
            debug!(processor = %self.processor, "failure reported after processor stopped");
        }
    }

    /// True once the pipeline is being torn down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that fires when the pipeline is torn down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// Runs a processor in a dedicated tokio task.
pub struct ProcessorRunner {
    name: String,
    handle: JoinHandle<()>,
}

impl ProcessorRunner {
    /// Spawns a new processor task.
    ///
    /// # Arguments
    /// * `processor` - The processor implementation to run
    /// * `inbox` - Link to receive frames from (both directions)
    /// * `emitter` - Outgoing links to the neighbors
    /// * `reporter` - Reporter for handling errors
    /// * `counters` - Frame and timing counters for this processor
    pub fn spawn(
        processor: Box<dyn Processor>,
        inbox: LinkReceiver,
        emitter: FrameEmitter,
        reporter: Arc<dyn ErrorReporter>,
        counters: Arc<ProcessorCounters>,
    ) -> Self {
        let name = processor.name().to_string();
        let handle = tokio::spawn(run_processor(processor, inbox, emitter, reporter, counters));
        Self { name, handle }
    }

    /// Returns the name of the processor.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Handle that forcibly stops the task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Waits for the processor task to complete.
    pub async fn join(self) -> Result<(), String> {
        let name = self.name;
        self.handle.await.map_err(|e| {
            if e.is_cancelled() {
                format!("Processor '{}' was aborted", name)
            } else {
                format!("Processor '{}' task panicked", name)
            }
        })
    }
}

enum Exit {
    Ended,
    Cancelled,
    Failed(ProcessorError),
    Closed,
}

async fn run_processor(
    mut processor: Box<dyn Processor>,
    mut inbox: LinkReceiver,
    emitter: FrameEmitter,
    reporter: Arc<dyn ErrorReporter>,
    counters: Arc<ProcessorCounters>,
) {
    let name = processor.name().to_string();
    debug!(processor = %name, "processor started");

    let exit = match guarded(processor.start(&emitter)).await {
        Ok(()) => {
            process_frames(
                processor.as_mut(),
                &mut inbox,
                &emitter,
                reporter.as_ref(),
                &counters,
            )
            .await
        }
        Err(error) => Exit::Failed(error),
    };

    match exit {
        Exit::Failed(error) => {
            reporter.report(&name, &error);
            let reason = error.cancel_reason(&name);
            cancel_processor(processor.as_mut(), &reason).await;
            for direction in [FrameDirection::Downstream, FrameDirection::Upstream] {
                if emitter
                    .push(Frame::cancel(reason.clone()), direction)
                    .await
                    .is_err()
                {
                    debug!(processor = %name, ?direction, "neighbor already stopped");
                }
            }
        }
        Exit::Ended => debug!(processor = %name, "end of stream"),
        Exit::Cancelled | Exit::Closed => {}
    }

    inbox.close();
    if AssertUnwindSafe(processor.shutdown())
        .catch_unwind()
        .await
        .is_err()
    {
        error!(processor = %name, "processor panicked during shutdown");
    }
    debug!(processor = %name, "processor stopped");
}

async fn process_frames(
    processor: &mut dyn Processor,
    inbox: &mut LinkReceiver,
    emitter: &FrameEmitter,
    reporter: &dyn ErrorReporter,
    counters: &ProcessorCounters,
) -> Exit {
    let name = processor.name().to_string();

    loop {
        let Some(inbound) = inbox.recv_inbound().await else {
            return Exit::Closed;
        };
        let (frame, direction) = match inbound {
            Inbound::Frame(frame, direction) => (frame, direction),
            Inbound::Failure(error) if error.is_recoverable() => {
                reporter.report(&name, &error);
                continue;
            }
            Inbound::Failure(error) => return Exit::Failed(error),
        };
        counters.record_frame();

        if matches!(frame.kind(), FrameKind::Cancel(_)) {
            return handle_cancel(processor, emitter, frame, direction).await;
        }

        let is_end = direction == FrameDirection::Downstream && matches!(frame.kind(), FrameKind::End);
        let mut out = Outbox::new();
        let started = Instant::now();
        let result = if is_end {
            let result = guarded(processor.on_end(&mut out)).await;
            out.forward(frame, FrameDirection::Downstream);
            result
        } else {
            guarded(processor.process(frame, direction, &mut out)).await
        };
        counters.record_processing(started.elapsed());

        if let Err(error) = result {
            if !error.is_recoverable() {
                return Exit::Failed(error);
            }
            reporter.report(&name, &error);
            if !is_end {
                continue;
            }
        }

        let mut stop = None;
        for (frame, direction) in out.drain() {
            if emitter.push(frame, direction).await.is_err() {
                stop = on_link_closed(processor, inbox, emitter).await;
                break;
            }
        }
        if let Some(exit) = stop {
            return exit;
        }
        if is_end {
            return Exit::Ended;
        }
    }
}

/// A neighbor stopped accepting frames. If it stopped because of a Cancel,
/// that Cancel is already waiting here; otherwise the neighbor died.
async fn on_link_closed(
    processor: &mut dyn Processor,
    inbox: &mut LinkReceiver,
    emitter: &FrameEmitter,
) -> Option<Exit> {
    if let Some((frame, direction)) = inbox.take_pending_cancel() {
        return Some(handle_cancel(processor, emitter, frame, direction).await);
    }
    if emitter.is_cancelled() {
        // Teardown underway; the Cancel frame is on its way.
        return None;
    }
    Some(Exit::Failed(ProcessorError::Fatal(
        "link to neighboring processor closed".to_string(),
    )))
}

async fn handle_cancel(
    processor: &mut dyn Processor,
    emitter: &FrameEmitter,
    frame: Frame,
    direction: FrameDirection,
) -> Exit {
    if let FrameKind::Cancel(reason) = frame.kind() {
        debug!(processor = %processor.name(), %reason, ?direction, "cancel received");
        cancel_processor(processor, reason).await;
    }
    if emitter.push(frame, direction).await.is_err() {
        debug!(processor = %emitter.processor(), ?direction, "cancel not forwarded, neighbor stopped");
    }
    Exit::Cancelled
}

async fn cancel_processor(processor: &mut dyn Processor, reason: &CancelReason) {
    let name = processor.name().to_string();
    if AssertUnwindSafe(processor.on_cancel(reason))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(processor = %name, "processor panicked while cancelling");
    }
}

/// Runs a handler future, turning a panic into a fatal error.
async fn guarded<F>(future: F) -> Result<(), ProcessorError>
where
    F: Future<Output = Result<(), ProcessorError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ProcessorError::Fatal(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
