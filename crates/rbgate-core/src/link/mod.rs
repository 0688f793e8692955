//! Red-black link protocol primitives.
//!
//! The link carries control messages between the untrusted (red) domain and
//! the trusted (black) domain while the isolators are enabled. This module
//! holds the runtime-free parts: the frame codec and the inbound validator.
//! The async channel lives in the daemon.
//!
//! # Trust Model
//!
//! Every inbound frame is adversarial input. A frame is accepted only if its
//! sequence number strictly exceeds the last accepted one and it echoes the
//! freshness token most recently issued by the trusted side. The untrusted
//! domain never originates a token.

mod error;
mod frame;
mod validator;

pub use error::ProtocolFault;
pub use frame::{
    FrameError, FreshnessToken, HEADER_LEN, LinkFrame, LinkMessage, MAX_FRAME_LEN, MessageKind,
    TOKEN_LEN,
};
pub use validator::{FrameValidator, LinkStats};
