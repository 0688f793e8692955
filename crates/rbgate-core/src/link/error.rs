//! Protocol fault types for inbound link validation.

use thiserror::Error;

use super::frame::FrameError;

/// Reason an inbound frame was dropped.
///
/// Protocol faults are absorbed at the link boundary: the frame is counted,
/// logged and discarded. They never reach the isolation state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    /// Frame could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    /// Sequence number did not strictly increase.
    #[error("stale sequence {received}, last accepted {last}")]
    StaleSequence {
        /// Last accepted sequence number.
        last: u64,
        /// Received sequence number.
        received: u64,
    },

    /// Token does not match the most recently issued token.
    #[error("freshness token mismatch")]
    TokenMismatch,

    /// No token is outstanding, so no inbound frame can be fresh.
    #[error("no freshness token issued")]
    NoTokenIssued,
}

impl ProtocolFault {
    /// Returns the machine-readable error code for this fault.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "LINK_MALFORMED",
            Self::StaleSequence { .. } => "LINK_STALE_SEQUENCE",
            Self::TokenMismatch => "LINK_TOKEN_MISMATCH",
            Self::NoTokenIssued => "LINK_NO_TOKEN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ProtocolFault::StaleSequence {
                last: 42,
                received: 41
            }
            .error_code(),
            "LINK_STALE_SEQUENCE"
        );
        assert_eq!(ProtocolFault::TokenMismatch.error_code(), "LINK_TOKEN_MISMATCH");
    }

    #[test]
    fn test_stale_sequence_message() {
        let fault = ProtocolFault::StaleSequence {
            last: 42,
            received: 41,
        };
        assert_eq!(fault.to_string(), "stale sequence 41, last accepted 42");
    }
}
