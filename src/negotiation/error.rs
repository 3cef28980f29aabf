use super::state::NegotiationState;
use crate::protocol::RoomId;
use std::fmt;
use thiserror::Error;

/// Malformed or out-of-state signaling, or a payload the media layer
/// refused. Recovered by closing the current session, never fatal to the
/// engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Malformed signaling message: {0}")]
    MalformedSignal(String),

    #[error("Media layer rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("'{event}' is not valid while {state}")]
    InvalidState {
        event: &'static str,
        state: NegotiationState,
    },

    #[error("Message for room {0} does not belong to the active session")]
    RoomMismatch(RoomId),

    #[error("No active session")]
    NoSession,

    #[error("Another negotiation step is still in flight")]
    OperationInFlight,

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl NegotiationError {
    pub fn rejected(operation: &'static str, reason: impl fmt::Display) -> Self {
        NegotiationError::Rejected {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Errors that only mean "this input does not apply right now". They are
    /// logged and the input is dropped; the session stays as it is.
    pub fn is_discardable(&self) -> bool {
        matches!(
            self,
            NegotiationError::MalformedSignal(_)
                | NegotiationError::InvalidState { .. }
                | NegotiationError::RoomMismatch(_)
                | NegotiationError::NoSession
        )
    }
}
