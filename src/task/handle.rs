//! Cloneable control surface for a running task.

use crate::error::{Result, VocalinkError};
use crate::frames::{CancelReason, Frame, FrameDirection};
use crate::pipeline::link::LinkSender;
use crate::pipeline::metrics::{LatencyStats, ProcessorStats};
use crate::session::SessionState;
use crate::task::events::StopReason;
use tokio::sync::{mpsc, watch};

/// Requests from handles to the task's run loop.
#[derive(Debug)]
pub(crate) enum TaskCommand {
    Cancel(CancelReason),
    /// Frames were queued at the entry; counts as activity.
    Queued(usize),
}

/// Counters collected while the task runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMetrics {
    /// Frames that reached the end of the pipeline.
    pub frames_out: u64,
    /// Frames injected through a [`TaskHandle`].
    pub frames_queued: u64,
    /// Responses completed at the sink.
    pub turns: usize,
    pub interruptions: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Droppable frames discarded on full links.
    pub dropped_frames: u64,
    pub latency: Option<LatencyStats>,
    pub processors: Vec<ProcessorStats>,
}

/// Final result of [`PipelineTask::run`](crate::task::PipelineTask::run).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub reason: StopReason,
    /// Processors that had to be aborted after the grace period.
    pub aborted: Vec<String>,
    pub metrics: TaskMetrics,
}

impl TaskOutcome {
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
            && !self
                .reason
                .cancel_reason()
                .is_some_and(CancelReason::is_failure)
    }
}

#[derive(Clone)]
pub struct TaskHandle {
    entry: LinkSender,
    commands: mpsc::UnboundedSender<TaskCommand>,
    outcome: watch::Receiver<Option<TaskOutcome>>,
    state: watch::Receiver<SessionState>,
    metrics: watch::Receiver<TaskMetrics>,
}

impl TaskHandle {
    pub(crate) fn new(
        entry: LinkSender,
        commands: mpsc::UnboundedSender<TaskCommand>,
        outcome: watch::Receiver<Option<TaskOutcome>>,
        state: watch::Receiver<SessionState>,
        metrics: watch::Receiver<TaskMetrics>,
    ) -> Self {
        Self {
            entry,
            commands,
            outcome,
            state,
            metrics,
        }
    }

    /// Injects frames at the head of the pipeline, in order.
    ///
    /// Waits while the entry link is full. Frames queued before `run` starts
    /// are held until the pipeline is running.
    pub async fn queue_frames(&self, frames: Vec<Frame>) -> Result<()> {
        let count = frames.len();
        for frame in frames {
            self.entry
                .send(frame, FrameDirection::Downstream)
                .await
                .map_err(|_| VocalinkError::PipelineClosed {
                    message: "pipeline entry no longer accepts frames".to_string(),
                })?;
        }
        if self.commands.send(TaskCommand::Queued(count)).is_err() {
            // Run loop already finished; the frames were still delivered
        }
        Ok(())
    }

    pub async fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.queue_frames(vec![frame]).await
    }

    /// Cancels with [`CancelReason::Requested`] and waits for teardown.
    pub async fn cancel(&self) -> Result<TaskOutcome> {
        self.cancel_with(CancelReason::Requested).await
    }

    /// Cancels the task and waits until every processor has stopped or been
    /// aborted. If the task already finished, returns its outcome.
    pub async fn cancel_with(&self, reason: CancelReason) -> Result<TaskOutcome> {
        if self.commands.send(TaskCommand::Cancel(reason)).is_err() {
            tracing::debug!("task already stopped, returning its outcome");
        }
        self.wait().await
    }

    /// Waits for the task to finish without cancelling it.
    pub async fn wait(&self) -> Result<TaskOutcome> {
        let mut outcome = self.outcome.clone();
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| VocalinkError::PipelineClosed {
                message: "task dropped before finishing".to_string(),
            })?;
        finished.clone().ok_or_else(|| VocalinkError::PipelineClosed {
            message: "task finished without an outcome".to_string(),
        })
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Snapshot of the task's counters.
    pub fn metrics(&self) -> TaskMetrics {
        self.metrics.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::link::link;

    fn handle() -> (
        TaskHandle,
        crate::pipeline::link::LinkReceiver,
        mpsc::UnboundedReceiver<TaskCommand>,
        watch::Sender<Option<TaskOutcome>>,
    ) {
        let (entry, inbox) = link(4);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (_state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (_metrics_tx, metrics_rx) = watch::channel(TaskMetrics::default());
        let handle = TaskHandle::new(entry, commands_tx, outcome_rx, state_rx, metrics_rx);
        (handle, inbox, commands_rx, outcome_tx)
    }

    #[tokio::test]
    async fn test_queue_frames_reports_count() {
        let (handle, mut inbox, mut commands, _outcome) = handle();
        handle
            .queue_frames(vec![Frame::run_trigger(), Frame::end()])
            .await
            .unwrap();

        assert!(matches!(commands.recv().await, Some(TaskCommand::Queued(2))));
        assert_eq!(inbox.recv().await.unwrap().0.name(), "RunTrigger");
        assert_eq!(inbox.recv().await.unwrap().0.name(), "End");
    }

    #[tokio::test]
    async fn test_queue_after_close_fails() {
        let (handle, inbox, _commands, _outcome) = handle();
        drop(inbox);
        assert!(matches!(
            handle.queue_frame(Frame::run_trigger()).await,
            Err(VocalinkError::PipelineClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_waits_for_outcome() {
        let (handle, _inbox, mut commands, outcome_tx) = handle();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.cancel().await }
        });

        assert!(matches!(
            commands.recv().await,
            Some(TaskCommand::Cancel(CancelReason::Requested))
        ));
        assert!(!handle.is_finished());
        outcome_tx.send_replace(Some(TaskOutcome {
            reason: StopReason::Cancelled(CancelReason::Requested),
            aborted: Vec::new(),
            metrics: TaskMetrics::default(),
        }));

        let outcome = waiter.await.unwrap().unwrap();
        assert!(outcome.is_clean());
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_wait_fails_when_task_dropped() {
        let (handle, _inbox, _commands, outcome_tx) = handle();
        drop(outcome_tx);
        assert!(handle.wait().await.is_err());
    }

    #[test]
    fn test_failure_outcome_is_not_clean() {
        let outcome = TaskOutcome {
            reason: StopReason::Cancelled(CancelReason::TransportFailure {
                message: "reset".to_string(),
            }),
            aborted: Vec::new(),
            metrics: TaskMetrics::default(),
        };
        assert!(!outcome.is_clean());
    }
}
