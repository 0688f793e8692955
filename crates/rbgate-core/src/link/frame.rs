//! Link frame types and binary codec.
//!
//! # Wire Format
//!
//! All integers are big-endian.
//!
//! ```text
//! +-----------+-------------+--------+-----------+-----------+
//! | seq (8)   | token (16)  | tag(1) | len (2)   | payload   |
//! +-----------+-------------+--------+-----------+-----------+
//! ```
//!
//! Payload size is fixed per message kind: one byte (veto reason code) for
//! `IsolationVeto`, zero for every other kind. Frames that disagree with
//! their declared or per-kind length are rejected before any field is
//! interpreted.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::policy::VetoReason;

/// Width of the freshness token in bytes.
pub const TOKEN_LEN: usize = 16;

/// Fixed header length: sequence, token, tag and payload length.
pub const HEADER_LEN: usize = 8 + TOKEN_LEN + 1 + 2;

/// Maximum encoded frame length accepted by the decoder.
pub const MAX_FRAME_LEN: usize = 64;

/// Frame codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame shorter than the fixed header.
    #[error("frame too short: {len} bytes, header is {HEADER_LEN}")]
    TooShort {
        /// Received length.
        len: usize,
    },

    /// Frame longer than [`MAX_FRAME_LEN`].
    #[error("frame too long: {len} bytes exceeds {MAX_FRAME_LEN}")]
    TooLong {
        /// Received length.
        len: usize,
    },

    /// Tag byte does not name a message kind.
    #[error("unknown message tag 0x{tag:02x}")]
    UnknownTag {
        /// The tag byte.
        tag: u8,
    },

    /// Declared payload length disagrees with the bytes present.
    #[error("declared payload length {declared} but {actual} bytes follow header")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// Payload length is wrong for the message kind.
    #[error("{kind} payload must be {expected} bytes, got {actual}")]
    PayloadSize {
        /// Message kind.
        kind: MessageKind,
        /// Required payload length.
        expected: usize,
        /// Received payload length.
        actual: usize,
    },
}

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Untrusted domain asks to enter isolation.
    IsolationRequest,
    /// Trusted domain accepts isolation.
    IsolationAck,
    /// Trusted domain declines isolation.
    IsolationVeto,
    /// Rejoin request. Never obeyed; rejoin is trusted-initiated.
    RejoinRequest,
    /// Trusted domain announces completed rejoin.
    RejoinAck,
    /// Keep-alive; also carries a fresh token.
    Heartbeat,
}

impl MessageKind {
    /// Wire tag for this kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::IsolationRequest => 0x01,
            Self::IsolationAck => 0x02,
            Self::IsolationVeto => 0x03,
            Self::RejoinRequest => 0x04,
            Self::RejoinAck => 0x05,
            Self::Heartbeat => 0x06,
        }
    }

    /// Parses a wire tag.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownTag`] for unassigned tags.
    pub const fn from_tag(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0x01 => Ok(Self::IsolationRequest),
            0x02 => Ok(Self::IsolationAck),
            0x03 => Ok(Self::IsolationVeto),
            0x04 => Ok(Self::RejoinRequest),
            0x05 => Ok(Self::RejoinAck),
            0x06 => Ok(Self::Heartbeat),
            _ => Err(FrameError::UnknownTag { tag }),
        }
    }

    /// Payload length required for this kind.
    #[must_use]
    pub const fn payload_len(self) -> usize {
        match self {
            Self::IsolationVeto => 1,
            _ => 0,
        }
    }

    /// Returns the kind name as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IsolationRequest => "IsolationRequest",
            Self::IsolationAck => "IsolationAck",
            Self::IsolationVeto => "IsolationVeto",
            Self::RejoinRequest => "RejoinRequest",
            Self::RejoinAck => "RejoinAck",
            Self::Heartbeat => "Heartbeat",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A link protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkMessage {
    /// See [`MessageKind::IsolationRequest`].
    IsolationRequest,
    /// See [`MessageKind::IsolationAck`].
    IsolationAck,
    /// See [`MessageKind::IsolationVeto`].
    IsolationVeto {
        /// Why isolation was declined.
        reason: VetoReason,
    },
    /// See [`MessageKind::RejoinRequest`].
    RejoinRequest,
    /// See [`MessageKind::RejoinAck`].
    RejoinAck,
    /// See [`MessageKind::Heartbeat`].
    Heartbeat,
}

impl LinkMessage {
    /// Returns the kind tag of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::IsolationRequest => MessageKind::IsolationRequest,
            Self::IsolationAck => MessageKind::IsolationAck,
            Self::IsolationVeto { .. } => MessageKind::IsolationVeto,
            Self::RejoinRequest => MessageKind::RejoinRequest,
            Self::RejoinAck => MessageKind::RejoinAck,
            Self::Heartbeat => MessageKind::Heartbeat,
        }
    }

    fn from_parts(kind: MessageKind, payload: &[u8]) -> Self {
        match kind {
            MessageKind::IsolationRequest => Self::IsolationRequest,
            MessageKind::IsolationAck => Self::IsolationAck,
            MessageKind::IsolationVeto => Self::IsolationVeto {
                reason: VetoReason::from_code(payload[0]),
            },
            MessageKind::RejoinRequest => Self::RejoinRequest,
            MessageKind::RejoinAck => Self::RejoinAck,
            MessageKind::Heartbeat => Self::Heartbeat,
        }
    }
}

/// Freshness token chosen by the trusted domain.
///
/// The untrusted domain only ever echoes a token it was given.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreshnessToken([u8; TOKEN_LEN]);

impl FreshnessToken {
    /// Wraps raw token bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Draws a token from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the token bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Constant-time comparison.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Debug for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First four bytes only.
        write!(f, "FreshnessToken({}..)", hex::encode(&self.0[..4]))
    }
}

/// A sequenced, token-bearing link frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFrame {
    /// Sender's monotonic sequence number.
    pub sequence: u64,
    /// Freshness token.
    pub token: FreshnessToken,
    /// Message body.
    pub message: LinkMessage,
}

impl LinkFrame {
    /// Encodes the frame to its wire form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let kind = self.message.kind();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + kind.payload_len());
        buf.put_u64(self.sequence);
        buf.put_slice(self.token.as_bytes());
        buf.put_u8(kind.tag());
        // Payload lengths are at most one byte.
        #[allow(clippy::cast_possible_truncation)]
        let declared = kind.payload_len() as u16;
        buf.put_u16(declared);
        if let LinkMessage::IsolationVeto { reason } = self.message {
            buf.put_u8(reason.code());
        }
        buf.freeze()
    }

    /// Decodes a frame from its wire form.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the frame is truncated, oversized,
    /// carries an unknown tag, or its payload length is inconsistent.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLong { len: bytes.len() });
        }
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort { len: bytes.len() });
        }

        let (seq_bytes, rest) = bytes.split_at(8);
        let (token_bytes, rest) = rest.split_at(TOKEN_LEN);
        let (tag, rest) = rest.split_at(1);
        let (len_bytes, payload) = rest.split_at(2);

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(seq_bytes);
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(token_bytes);
        let declared = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));

        let kind = MessageKind::from_tag(tag[0])?;
        if declared != payload.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        if payload.len() != kind.payload_len() {
            return Err(FrameError::PayloadSize {
                kind,
                expected: kind.payload_len(),
                actual: payload.len(),
            });
        }

        Ok(Self {
            sequence: u64::from_be_bytes(sequence),
            token: FreshnessToken::from_bytes(token),
            message: LinkMessage::from_parts(kind, payload),
        })
    }
}
