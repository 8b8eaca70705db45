//! Session lifecycle state machine.

use crate::frames::{Frame, FrameKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No client yet.
    #[default]
    Idle,
    Connected,
    /// The user is speaking.
    ActiveTurn,
    /// A turn closed; the model has been asked to respond.
    WaitingForModel,
    Disconnected,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Cancelled)
    }

    /// Applies one signal. Signals that do not apply leave the state as is.
    pub fn next(self, signal: SessionSignal) -> SessionState {
        use SessionSignal as S;
        use SessionState::*;

        if self.is_terminal() {
            return self;
        }
        match (self, signal) {
            (_, S::Disconnected) => Disconnected,
            (_, S::Cancelled) => Cancelled,
            (Idle, S::Connected) => Connected,
            (Connected | WaitingForModel, S::SpeechStarted) => ActiveTurn,
            (Connected | ActiveTurn, S::TurnClosed) => WaitingForModel,
            (WaitingForModel, S::ResponseCompleted) => Connected,
            (state, _) => state,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::ActiveTurn => "active_turn",
            SessionState::WaitingForModel => "waiting_for_model",
            SessionState::Disconnected => "disconnected",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Inputs that move the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Connected,
    SpeechStarted,
    /// The user's turn closed: SpeechStopped, EndOfTurn or a RunTrigger.
    TurnClosed,
    ResponseCompleted,
    Disconnected,
    Cancelled,
}

impl SessionSignal {
    /// Signal carried by a frame observed at the end of the pipeline, if any.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.kind() {
            FrameKind::SpeechStarted => Some(SessionSignal::SpeechStarted),
            FrameKind::SpeechStopped | FrameKind::EndOfTurn | FrameKind::RunTrigger => {
                Some(SessionSignal::TurnClosed)
            }
            FrameKind::ResponseCompleted => Some(SessionSignal::ResponseCompleted),
            FrameKind::Cancel(_) => Some(SessionSignal::Cancelled),
            _ => None,
        }
    }
}
