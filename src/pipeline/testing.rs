//! Test helpers for driving a single processor through its runner.

use crate::frames::{Frame, FrameDirection, FrameKind};
use crate::pipeline::error::{ErrorReporter, ProcessorError};
use crate::pipeline::link::{LinkReceiver, LinkSender, link};
use crate::pipeline::metrics::ProcessorCounters;
use crate::pipeline::processor::{FrameEmitter, Processor, ProcessorRunner};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Records every report for assertions.
#[derive(Debug, Default)]
pub(crate) struct MockReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl MockReporter {
    pub(crate) fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for MockReporter {
    fn report(&self, processor: &str, error: &ProcessorError) {
        self.reports
            .lock()
            .unwrap()
            .push((processor.to_string(), error.to_string()));
    }
}

/// One processor wired between two test-owned links.
pub(crate) struct ProcessorHarness {
    input: LinkSender,
    pub(crate) downstream: LinkReceiver,
    pub(crate) upstream: LinkReceiver,
    pub(crate) reporter: Arc<MockReporter>,
    pub(crate) counters: Arc<ProcessorCounters>,
    pub(crate) token: CancellationToken,
    runner: Option<ProcessorRunner>,
}

impl ProcessorHarness {
    pub(crate) fn start(processor: impl Processor) -> Self {
        let (input, inbox) = link(8);
        let (down_tx, downstream) = link(64);
        let (up_tx, upstream) = link(64);
        let token = CancellationToken::new();
        let emitter = FrameEmitter::new(
            processor.name(),
            down_tx,
            up_tx,
            input.clone(),
            token.clone(),
        );
        let reporter = Arc::new(MockReporter::default());
        let counters = Arc::new(ProcessorCounters::new(processor.name()));
        let runner = ProcessorRunner::spawn(
            Box::new(processor),
            inbox,
            emitter,
            reporter.clone(),
            counters.clone(),
        );
        Self {
            input,
            downstream,
            upstream,
            reporter,
            counters,
            token,
            runner: Some(runner),
        }
    }

    pub(crate) async fn send(&self, frame: Frame) {
        self.input
            .send(frame, FrameDirection::Downstream)
            .await
            .unwrap();
    }

    pub(crate) async fn send_upstream(&self, frame: Frame) {
        self.input
            .send(frame, FrameDirection::Upstream)
            .await
            .unwrap();
    }

    /// Downstream frame kinds up to and including the first End or Cancel.
    pub(crate) async fn collect_downstream(&mut self) -> Vec<FrameKind> {
        let mut kinds = Vec::new();
        loop {
            let (frame, _) = tokio::time::timeout(WAIT, self.downstream.recv())
                .await
                .expect("timed out waiting for downstream frame")
                .expect("downstream link closed");
            let kind = frame.into_kind();
            let terminal = matches!(kind, FrameKind::End | FrameKind::Cancel(_));
            kinds.push(kind);
            if terminal {
                return kinds;
            }
        }
    }

    pub(crate) fn close_downstream(&mut self) {
        self.downstream.close();
    }

    pub(crate) async fn join(&mut self) {
        if let Some(runner) = self.runner.take() {
            tokio::time::timeout(WAIT, runner.join())
                .await
                .expect("processor did not stop")
                .unwrap();
        }
    }
}
