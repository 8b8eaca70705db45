//! Events a running task publishes to observers.

use crate::frames::CancelReason;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};

/// How a task finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopReason {
    /// `End` reached the sink: all input was processed.
    Completed,
    Cancelled(CancelReason),
}

impl StopReason {
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            StopReason::Completed => None,
            StopReason::Cancelled(reason) => Some(reason),
        }
    }
}

/// Notifications sent on the task's optional event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ClientConnected {
        client_id: String,
    },
    UserStartedSpeaking,
    UserStoppedSpeaking,
    /// The user barged in on a response.
    Interrupted,
    /// A response completed at the sink.
    TurnCompleted {
        turn: usize,
        response_latency_ms: Option<u64>,
        total_latency_ms: Option<u64>,
    },
    Ttfb {
        processor: String,
        ms: u64,
    },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Stopped {
        reason: StopReason,
    },
}

impl PipelineEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Non-blocking send; a full or disconnected observer never stalls the task.
pub(crate) fn emit(tx: &Option<crossbeam_channel::Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = tx
        && tx.try_send(event).is_err()
    {
        // Observer lagging or gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_change_json() {
        let event = PipelineEvent::StateChanged {
            from: SessionState::Idle,
            to: SessionState::Connected,
        };
        let json = event.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"state_changed","from":"idle","to":"connected"}"#
        );
        assert_eq!(PipelineEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_stopped_carries_cancel_reason() {
        let event = PipelineEvent::Stopped {
            reason: StopReason::Cancelled(CancelReason::IdleTimeout),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""status":"cancelled""#));
        assert!(json.contains(r#""kind":"idle_timeout""#));
        assert_eq!(PipelineEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_emit_without_receiver_is_silent() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        emit(&Some(tx), PipelineEvent::Interrupted);
        emit(&None, PipelineEvent::Interrupted);
    }

    #[test]
    fn test_emit_on_full_channel_drops() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let tx = Some(tx);
        emit(&tx, PipelineEvent::UserStartedSpeaking);
        emit(&tx, PipelineEvent::UserStoppedSpeaking);
        assert_eq!(rx.try_recv().unwrap(), PipelineEvent::UserStartedSpeaking);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_reason_accessor() {
        assert_eq!(StopReason::Completed.cancel_reason(), None);
        assert_eq!(
            StopReason::Cancelled(CancelReason::Requested).cancel_reason(),
            Some(&CancelReason::Requested)
        );
    }
}
