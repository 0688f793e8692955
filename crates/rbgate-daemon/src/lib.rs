//! # rbgate-daemon
//!
//! Async runtime for the red/black isolation controller.
//!
//! - [`sequencer`]: ordered, time-bounded switch and isolator driver
//! - [`tamper`]: edge-to-task tamper notification
//! - [`link`]: gated, validated link channel to the untrusted domain
//! - [`controller`]: the isolation state owner and its policy handle
//! - [`board`]: in-memory board used by the binary and by tests

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod board;
pub mod controller;
pub mod link;
pub mod sequencer;
pub mod tamper;

pub use controller::{
    ControllerError, ControllerReport, IsolationController, PolicyHandle, PowerMonitor,
    TrustedSignal,
};
pub use link::{LinkError, LinkGate, RedBlackLink};
pub use sequencer::{ControlLines, PendingTransition, PowerSequencer, SequenceOutcome, SequencerError};
pub use tamper::{TamperInput, TamperMonitor, tamper_channel};
