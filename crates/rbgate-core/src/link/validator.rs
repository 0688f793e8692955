//! Inbound frame validation and outbound frame issuance.
//!
//! # Invariants
//!
//! - [INV-LV001] An accepted inbound sequence number is strictly greater than
//!   every previously accepted one. There is no wraparound.
//! - [INV-LV002] An accepted inbound token equals the most recently issued
//!   outbound token (constant-time comparison).
//! - [INV-LV003] Rejected frames never update validator state other than
//!   the fault counters.

use serde::{Deserialize, Serialize};

use super::error::ProtocolFault;
use super::frame::{FreshnessToken, LinkFrame, LinkMessage};

/// Link frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Inbound frames accepted.
    pub accepted: u64,
    /// Outbound frames issued.
    pub sent: u64,
    /// Inbound frames dropped as malformed.
    pub malformed: u64,
    /// Inbound frames dropped for a stale sequence number.
    pub stale_sequence: u64,
    /// Inbound frames dropped for a token mismatch (including no token).
    pub token_mismatch: u64,
}

impl LinkStats {
    /// Total inbound frames dropped.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.malformed
            .saturating_add(self.stale_sequence)
            .saturating_add(self.token_mismatch)
    }
}

/// Sequence and freshness state for one link endpoint (trusted side).
#[derive(Debug, Default)]
pub struct FrameValidator {
    last_accepted: Option<u64>,
    issued: Option<FreshnessToken>,
    next_outbound: u64,
    stats: LinkStats,
}

impl FrameValidator {
    /// Creates a validator with no accepted frames and no issued token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the next outbound frame, issuing a fresh token with it.
    ///
    /// The new token supersedes any previously issued token.
    pub fn issue(&mut self, message: LinkMessage) -> LinkFrame {
        self.issue_with_token(message, FreshnessToken::generate())
    }

    /// Like [`Self::issue`] with a caller-supplied token.
    pub fn issue_with_token(&mut self, message: LinkMessage, token: FreshnessToken) -> LinkFrame {
        self.next_outbound = self.next_outbound.saturating_add(1);
        self.issued = Some(token);
        self.stats.sent = self.stats.sent.saturating_add(1);
        LinkFrame {
            sequence: self.next_outbound,
            token,
            message,
        }
    }

    /// Revokes the outstanding token. Inbound frames are rejected until the
    /// next [`Self::issue`].
    pub const fn revoke_token(&mut self) {
        self.issued = None;
    }

    /// Decodes and validates an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns the [`ProtocolFault`] that caused the frame to be dropped.
    pub fn accept(&mut self, bytes: &[u8]) -> Result<LinkFrame, ProtocolFault> {
        let frame = match LinkFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed = self.stats.malformed.saturating_add(1);
                return Err(ProtocolFault::Malformed(e));
            },
        };
        self.accept_frame(frame)
    }

    /// Validates an already-decoded inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolFault::StaleSequence`], [`ProtocolFault::NoTokenIssued`]
    /// or [`ProtocolFault::TokenMismatch`].
    pub fn accept_frame(&mut self, frame: LinkFrame) -> Result<LinkFrame, ProtocolFault> {
        if let Some(last) = self.last_accepted {
            if frame.sequence <= last {
                self.stats.stale_sequence = self.stats.stale_sequence.saturating_add(1);
                return Err(ProtocolFault::StaleSequence {
                    last,
                    received: frame.sequence,
                });
            }
        }

        let Some(issued) = self.issued else {
            self.stats.token_mismatch = self.stats.token_mismatch.saturating_add(1);
            return Err(ProtocolFault::NoTokenIssued);
        };
        if !issued.matches(&frame.token) {
            self.stats.token_mismatch = self.stats.token_mismatch.saturating_add(1);
            return Err(ProtocolFault::TokenMismatch);
        }

        self.last_accepted = Some(frame.sequence);
        self.stats.accepted = self.stats.accepted.saturating_add(1);
        Ok(frame)
    }

    /// Last accepted inbound sequence number.
    #[must_use]
    pub const fn last_accepted(&self) -> Option<u64> {
        self.last_accepted
    }

    /// Currently outstanding token.
    #[must_use]
    pub const fn issued_token(&self) -> Option<FreshnessToken> {
        self.issued
    }

    /// Frame counters.
    #[must_use]
    pub const fn stats(&self) -> LinkStats {
        self.stats
    }
}
