//! Isolation state machine.
//!
//! The controller's state is a closed enumeration advanced only by the
//! [`transition`] table. Every side effect the table commands is returned as
//! an ordered list of [`Effect`]s for the runtime to carry out.
//!
//! # State Machine
//!
//! ```text
//!   ┌───────────┐ LinkEstablished ┌────────────┐ SequenceCompleted ┌───────────┐
//!   │ PoweredUp │────────────────▶│ BringingUp │──────────────────▶│ Connected │◀──┐
//!   └───────────┘                 └─────┬──────┘                   └─────┬─────┘   │
//!                                       │ fault       IsolationRequested │         │
//!                                       ▼                  (permitted)   ▼         │
//!                                ┌───────────┐         ┌───────────────────┐       │
//!                                │ SafeFault │         │ EnteringIsolation │─fault─┤
//!                                └───────────┘         └─────────┬─────────┘       │
//!                                      ▲       SequenceCompleted │                 │
//!                                      │                         ▼                 │
//!                                      │ fault            ┌──────────┐             │
//!                                      │                  │ Isolated │             │
//!                                      │                  └────┬─────┘             │
//!                                      │                       │ crypto done       │
//!                                      │                       ▼                   │
//!                                      │              ┌──────────────────────┐     │
//!                                      └──────────────│ Rejoining (2 phases) │◀────┘
//!                                                     └──────────────────────┘
//!
//!   Rejoining ──SequenceCompleted (settling)──▶ Connected
//!   any state ──Tamper──▶ TamperLatched (terminal)
//! ```
//!
//! # Invariants
//!
//! - [INV-IS001] No transition leaves `TamperLatched`.
//! - [INV-IS002] Only `Tamper` leaves `SafeFault`.
//! - [INV-IS003] `IsolationAck` is sent before the isolation target is
//!   submitted, so the acknowledgement leaves before the link drops.
//! - [INV-IS004] A `RejoinRequest` or any trusted-to-untrusted message kind
//!   received from the untrusted domain never changes state.
//! - [INV-IS005] While a submitted target is outstanding, only its outcome
//!   (or tamper) moves the state, so targets never overlap.

mod error;
mod state;
mod transition;


pub use error::TransitionError;
pub use state::{FaultedTransition, IsolationState, RejoinPhase};
pub use transition::{Effect, Transition, TransitionEvent, transition};
