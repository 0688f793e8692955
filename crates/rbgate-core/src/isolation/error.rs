//! Isolation state machine error types.

use thiserror::Error;

use super::state::IsolationState;
use super::transition::TransitionEvent;

/// Errors from the isolation transition function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The event is not defined for the current state.
    #[error("invalid transition from {from} via {event}")]
    InvalidTransition {
        /// State the event arrived in.
        from: IsolationState,
        /// The offending event.
        event: TransitionEvent,
    },
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = TransitionError::InvalidTransition {
            from: IsolationState::Isolated,
            event: TransitionEvent::SequenceCompleted,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition from Isolated via sequence_completed"
        );
    }
}
