//! The isolation transition table.
//!
//! [`transition`] is a pure function from `(state, event)` to the next state
//! and the ordered effects the controller must carry out. It never touches
//! hardware; the daemon executes the effects in order.

use std::fmt;

use super::error::TransitionError;
use super::state::{FaultedTransition, IsolationState, RejoinPhase};
use crate::link::{LinkMessage, MessageKind};
use crate::policy::IsolationVerdict;
use crate::switch::SwitchSet;

/// An input to the isolation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    /// The untrusted domain came up and the link may be brought up.
    LinkEstablished,
    /// A validated `IsolationRequest` with the guard's verdict.
    IsolationRequested(IsolationVerdict),
    /// A validated `Heartbeat`.
    Heartbeat,
    /// A validated `RejoinRequest`. Never obeyed.
    RejoinRequested,
    /// A validated trusted-to-untrusted message kind received from the
    /// untrusted side (`IsolationAck`, `IsolationVeto`, `RejoinAck`).
    UnexpectedMessage(MessageKind),
    /// The pending sequencer transition completed.
    SequenceCompleted,
    /// The pending sequencer transition faulted.
    SequenceFaulted,
    /// The trusted domain's own logic finished its isolated crypto work.
    CryptoOperationComplete,
    /// The hardware kill path fired.
    Tamper,
}

impl TransitionEvent {
    /// Returns the event name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LinkEstablished => "link_established",
            Self::IsolationRequested(IsolationVerdict::Permit) => "isolation_requested(permit)",
            Self::IsolationRequested(IsolationVerdict::Veto(_)) => "isolation_requested(veto)",
            Self::Heartbeat => "heartbeat",
            Self::RejoinRequested => "rejoin_requested",
            Self::UnexpectedMessage(_) => "unexpected_message",
            Self::SequenceCompleted => "sequence_completed",
            Self::SequenceFaulted => "sequence_faulted",
            Self::CryptoOperationComplete => "crypto_operation_complete",
            Self::Tamper => "tamper",
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A side effect commanded by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Send a message to the untrusted domain.
    Send(LinkMessage),
    /// Submit a target to the power sequencer.
    SubmitTarget(SwitchSet),
    /// Drive the isolators disabled immediately.
    ForceIsolatorsDisabled,
    /// Record an inbound protocol fault; the message is otherwise ignored.
    RecordProtocolFault,
}

/// Result of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: IsolationState,
    /// State after the event.
    pub to: IsolationState,
    /// Effects to carry out, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: IsolationState) -> Self {
        Self {
            from: state,
            to: state,
            effects: Vec::new(),
        }
    }

    fn move_to(from: IsolationState, to: IsolationState, effects: Vec<Effect>) -> Self {
        Self { from, to, effects }
    }

    /// Returns `true` if the state changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Returns `true` if any effect drives hardware.
    #[must_use]
    pub fn commands_hardware(&self) -> bool {
        self.effects.iter().any(|e| {
            matches!(
                e,
                Effect::SubmitTarget(_) | Effect::ForceIsolatorsDisabled
            )
        })
    }
}

/// Computes the next state and effects for `event` in `state`.
///
/// ```text
/// PoweredUp         --LinkEstablished-->          BringingUp  [submit connected]
/// BringingUp        --SequenceCompleted-->        Connected   [send Heartbeat]
/// Connected         --IsolationRequested(ok)-->   EnteringIsolation
///                                                   [send IsolationAck, submit isolated]
/// Connected         --IsolationRequested(veto)--> Connected   [send IsolationVeto]
/// EnteringIsolation --SequenceCompleted-->        Isolated
/// EnteringIsolation --SequenceFaulted-->          Rejoining(closing) [submit rejoin]
/// Isolated          --CryptoOperationComplete-->  Rejoining(closing) [submit rejoin]
/// Rejoining(closing)--SequenceCompleted-->        Rejoining(settling) [submit connected]
/// Rejoining(settling)--SequenceCompleted-->       Connected   [send RejoinAck]
/// Rejoining(*) / BringingUp --SequenceFaulted-->  SafeFault   [force isolators disabled]
/// any               --Tamper-->                   TamperLatched
/// ```
///
/// # Errors
///
/// Returns [`TransitionError::InvalidTransition`] for combinations the table
/// does not define. The state is unchanged in that case.
pub fn transition(
    state: IsolationState,
    event: TransitionEvent,
) -> Result<Transition, TransitionError> {
    use IsolationState as S;
    use TransitionEvent as E;

    let closing = S::Rejoining {
        phase: RejoinPhase::ClosingSwitches,
    };
    let settling = S::Rejoining {
        phase: RejoinPhase::Settling,
    };

    let next = match (state, event) {
        // Nothing leaves TamperLatched.
        (S::TamperLatched, _) => Transition::stay(state),
        (_, E::Tamper) => Transition::move_to(state, S::TamperLatched, Vec::new()),

        // SafeFault is held until reset.
        (S::SafeFault { .. }, _) => Transition::stay(state),

        (S::PoweredUp, E::LinkEstablished) => Transition::move_to(
            state,
            S::BringingUp,
            vec![Effect::SubmitTarget(SwitchSet::connected())],
        ),
        (S::BringingUp, E::SequenceCompleted) => Transition::move_to(
            state,
            S::Connected,
            vec![Effect::Send(LinkMessage::Heartbeat)],
        ),
        (S::BringingUp, E::SequenceFaulted) => Transition::move_to(
            state,
            S::SafeFault {
                during: FaultedTransition::BringUp,
            },
            vec![Effect::ForceIsolatorsDisabled],
        ),

        (S::Connected, E::IsolationRequested(IsolationVerdict::Permit)) => Transition::move_to(
            state,
            S::EnteringIsolation,
            vec![
                Effect::Send(LinkMessage::IsolationAck),
                Effect::SubmitTarget(SwitchSet::isolated()),
            ],
        ),
        (S::Connected, E::IsolationRequested(IsolationVerdict::Veto(reason))) => Transition::move_to(
            state,
            state,
            vec![Effect::Send(LinkMessage::IsolationVeto { reason })],
        ),
        (S::Connected, E::Heartbeat) => {
            Transition::move_to(state, state, vec![Effect::Send(LinkMessage::Heartbeat)])
        },
        (S::Connected | S::Rejoining { .. }, E::RejoinRequested)
        | (S::Connected, E::UnexpectedMessage(_)) => {
            Transition::move_to(state, state, vec![Effect::RecordProtocolFault])
        },

        (S::EnteringIsolation, E::SequenceCompleted) => {
            Transition::move_to(state, S::Isolated, Vec::new())
        },
        (S::EnteringIsolation, E::SequenceFaulted) | (S::Isolated, E::CryptoOperationComplete) => {
            Transition::move_to(
                state,
                closing,
                vec![Effect::SubmitTarget(SwitchSet::rejoin())],
            )
        },

        (
            S::Rejoining {
                phase: RejoinPhase::ClosingSwitches,
            },
            E::SequenceCompleted,
        ) => Transition::move_to(
            state,
            settling,
            vec![Effect::SubmitTarget(SwitchSet::connected())],
        ),
        (
            S::Rejoining {
                phase: RejoinPhase::Settling,
            },
            E::SequenceCompleted,
        ) => Transition::move_to(
            state,
            S::Connected,
            vec![Effect::Send(LinkMessage::RejoinAck)],
        ),
        (S::Rejoining { .. }, E::SequenceFaulted) => Transition::move_to(
            state,
            S::SafeFault {
                during: FaultedTransition::Rejoin,
            },
            vec![Effect::ForceIsolatorsDisabled],
        ),

        (from, event) => return Err(TransitionError::InvalidTransition { from, event }),
    };

    Ok(next)
}
