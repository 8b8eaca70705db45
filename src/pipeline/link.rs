//! Directed links between processors.
//!
//! Each link has two lanes. The data lane is a bounded tokio channel: a
//! producer that finds it full suspends until the consumer drains a slot.
//! The priority lane is unbounded and carries system frames (Cancel,
//! Interruption) plus everything travelling upstream, so control never
//! waits behind queued audio. Frames leave each lane in the order they
//! entered it, and the receiver always drains the priority lane first.

use crate::frames::{Frame, FrameDirection, FrameKind};
use crate::pipeline::error::ProcessorError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// An item waiting in a processor's inbound queue.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Frame, FrameDirection),
    /// Failure reported by work a processor spawned outside its handler.
    Failure(ProcessorError),
}

/// The receiving end of a link has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("link closed")]
pub struct LinkClosed;

/// Create a link whose data lane holds at most `capacity` frames.
pub fn link(capacity: usize) -> (LinkSender, LinkReceiver) {
    link_with_counter(capacity, Arc::new(AtomicU64::new(0)))
}

/// Like [`link`], but droppable frames discarded on a full data lane are
/// counted in a shared counter.
pub fn link_with_counter(capacity: usize, dropped: Arc<AtomicU64>) -> (LinkSender, LinkReceiver) {
    let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    (
        LinkSender {
            data: data_tx,
            priority: priority_tx,
            dropped,
        },
        LinkReceiver {
            data: data_rx,
            priority: priority_rx,
        },
    )
}

/// Producer side of a link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkSender {
    data: mpsc::Sender<Inbound>,
    priority: mpsc::UnboundedSender<Inbound>,
    dropped: Arc<AtomicU64>,
}

impl LinkSender {
    /// Push a frame onto the link.
    ///
    /// Data frames wait for space when the lane is full. Droppable frames
    /// are discarded instead of waiting.
    pub async fn send(&self, frame: Frame, direction: FrameDirection) -> Result<(), LinkClosed> {
        if direction == FrameDirection::Upstream || frame.is_system() {
            return self
                .priority
                .send(Inbound::Frame(frame, direction))
                .map_err(|_| LinkClosed);
        }

        if frame.is_droppable() {
            return match self.data.try_send(Inbound::Frame(frame, direction)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(LinkClosed),
            };
        }

        self.data
            .send(Inbound::Frame(frame, direction))
            .await
            .map_err(|_| LinkClosed)
    }

    pub(crate) fn send_failure(&self, error: ProcessorError) -> Result<(), LinkClosed> {
        self.priority
            .send(Inbound::Failure(error))
            .map_err(|_| LinkClosed)
    }

    /// Number of droppable frames discarded so far on links sharing this counter.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.data.is_closed()
    }
}

/// Consumer side of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    data: mpsc::Receiver<Inbound>,
    priority: mpsc::UnboundedReceiver<Inbound>,
}

impl LinkReceiver {
    /// Receive the next frame, priority lane first.
    ///
    /// Returns `None` once every sender is gone and both lanes are empty.
    pub async fn recv(&mut self) -> Option<(Frame, FrameDirection)> {
        loop {
            match self.recv_inbound().await? {
                Inbound::Frame(frame, direction) => return Some((frame, direction)),
                Inbound::Failure(_) => continue,
            }
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<(Frame, FrameDirection)> {
        loop {
            let inbound = match self.priority.try_recv() {
                Ok(inbound) => inbound,
                Err(_) => self.data.try_recv().ok()?,
            };
            if let Inbound::Frame(frame, direction) = inbound {
                return Some((frame, direction));
            }
        }
    }

    pub(crate) async fn recv_inbound(&mut self) -> Option<Inbound> {
        tokio::select! {
            biased;
            Some(inbound) = self.priority.recv() => Some(inbound),
            Some(inbound) = self.data.recv() => Some(inbound),
            else => None,
        }
    }

    /// Take a Cancel frame already waiting on the priority lane, if any.
    pub(crate) fn take_pending_cancel(&mut self) -> Option<(Frame, FrameDirection)> {
        while let Ok(inbound) = self.priority.try_recv() {
            if let Inbound::Frame(frame, direction) = inbound
                && matches!(frame.kind(), FrameKind::Cancel(_))
            {
                return Some((frame, direction));
            }
        }
        None
    }

    /// Stop accepting new frames. Frames already queued can still be received.
    pub fn close(&mut self) {
        self.data.close();
        self.priority.close();
    }
}
