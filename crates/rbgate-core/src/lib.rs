//! # rbgate-core
//!
//! Runtime-free domain model for a red/black isolation controller.
//!
//! A device holds key material in a trusted ("black") domain and talks to a
//! host through an untrusted ("red") domain. The two domains share power and
//! ground through controllable switches and exchange data through digital
//! isolators. This crate defines everything about that arrangement that can
//! be stated without an async runtime:
//!
//! - [`isolation`]: the closed state enumeration and its transition table
//! - [`switch`]: commanded switch positions and ordered step planning
//! - [`link`]: the inter-domain frame codec and inbound validation
//! - [`policy`]: per-state operation policy and the isolation guard
//! - [`tamper`]: the irreversible tamper event
//! - [`config`]: TOML configuration
//!
//! The `rbgate-daemon` crate drives these types against hardware.
//!
//! ## Example
//!
//! ```rust
//! use rbgate_core::isolation::{IsolationState, TransitionEvent, transition};
//! use rbgate_core::policy::{OperationClass, PolicyDecision};
//!
//! let t = transition(IsolationState::Connected, TransitionEvent::Tamper).unwrap();
//! assert_eq!(t.to, IsolationState::TamperLatched);
//!
//! let decision = PolicyDecision::for_state(t.to);
//! assert!(!decision.permits(OperationClass::Signing));
//! assert!(decision.permits(OperationClass::StatusDisplay));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod isolation;
pub mod link;
pub mod policy;
pub mod switch;
pub mod tamper;

pub use config::{ConfigError, LinkConfig, PolicyConfig, RbgateConfig, SequencerConfig};
pub use isolation::{IsolationState, TransitionError, TransitionEvent};
pub use link::{FrameValidator, LinkFrame, LinkMessage, ProtocolFault};
pub use policy::{IsolationVerdict, OperationClass, PolicyDecision, PowerStatus, VetoReason};
pub use switch::{SwitchFault, SwitchSet};
pub use tamper::TamperEvent;
