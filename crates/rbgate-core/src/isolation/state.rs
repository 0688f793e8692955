//! Isolation state types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sub-phase of a rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejoinPhase {
    /// Closing the ground and charge paths; isolators stay disabled.
    ClosingSwitches,
    /// Switches confirmed closed; settling rails before enabling isolators.
    Settling,
}

impl RejoinPhase {
    /// Returns the phase as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClosingSwitches => "closing_switches",
            Self::Settling => "settling",
        }
    }
}

/// Transition that was in flight when a safe fault was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultedTransition {
    /// Power-up bring-up of the isolators.
    BringUp,
    /// Rejoin after isolation (including the fallback rejoin after a failed
    /// isolation entry).
    Rejoin,
}

impl FaultedTransition {
    /// Returns the transition name as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BringUp => "bring_up",
            Self::Rejoin => "rejoin",
        }
    }
}

/// The isolation state of the device.
///
/// Exactly one instance exists, owned by the isolation controller and
/// advanced only through [`super::transition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IsolationState {
    /// Initial state after reset; isolators not yet enabled.
    #[default]
    PoweredUp,
    /// Bring-up target submitted; waiting for the isolators to enable.
    BringingUp,
    /// Both domains powered together, link enabled.
    Connected,
    /// Isolation target submitted; waiting for the sequencer.
    EnteringIsolation,
    /// No DC path between the domains; link disabled.
    Isolated,
    /// Rejoin in progress.
    Rejoining {
        /// Current sub-phase.
        phase: RejoinPhase,
    },
    /// A sequencer fault left the hardware ambiguous. Isolators are forced
    /// disabled and the fault is reported. Left only by reset or tamper.
    SafeFault {
        /// The transition that faulted.
        during: FaultedTransition,
    },
    /// Key material has been destroyed. Terminal until reset.
    TamperLatched,
}

impl IsolationState {
    /// Returns `true` if no transition can leave this state except tamper.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::SafeFault { .. } | Self::TamperLatched)
    }

    /// Returns `true` while a sequencer target submitted by this state's
    /// entry is still outstanding.
    #[must_use]
    pub const fn awaits_sequencer(&self) -> bool {
        matches!(
            self,
            Self::BringingUp | Self::EnteringIsolation | Self::Rejoining { .. }
        )
    }

    /// Returns `true` if the link to the untrusted domain is expected to be
    /// enabled in this state.
    #[must_use]
    pub const fn link_expected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns the state name as a static string, without phase detail.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PoweredUp => "PoweredUp",
            Self::BringingUp => "BringingUp",
            Self::Connected => "Connected",
            Self::EnteringIsolation => "EnteringIsolation",
            Self::Isolated => "Isolated",
            Self::Rejoining { .. } => "Rejoining",
            Self::SafeFault { .. } => "SafeFault",
            Self::TamperLatched => "TamperLatched",
        }
    }
}

impl fmt::Display for IsolationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejoining { phase } => write!(f, "Rejoining({})", phase.as_str()),
            Self::SafeFault { during } => write!(f, "SafeFault({})", during.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_default_is_powered_up() {
        assert_eq!(IsolationState::default(), IsolationState::PoweredUp);
    }

    #[test]
    fn test_terminal_states() {
        assert!(IsolationState::TamperLatched.is_terminal());
        assert!(
            IsolationState::SafeFault {
                during: FaultedTransition::Rejoin
            }
            .is_terminal()
        );
        assert!(!IsolationState::Isolated.is_terminal());
        assert!(!IsolationState::Connected.is_terminal());
    }

    #[test]
    fn test_display_includes_phase() {
        let state = IsolationState::Rejoining {
            phase: RejoinPhase::Settling,
        };
        assert_eq!(state.to_string(), "Rejoining(settling)");
        assert_eq!(IsolationState::Isolated.to_string(), "Isolated");
    }

    #[test]
    fn test_awaits_sequencer() {
        assert!(IsolationState::BringingUp.awaits_sequencer());
        assert!(IsolationState::EnteringIsolation.awaits_sequencer());
        assert!(!IsolationState::PoweredUp.awaits_sequencer());
        assert!(!IsolationState::Isolated.awaits_sequencer());
    }

    #[test]
    fn test_link_expected_only_when_connected() {
        assert!(IsolationState::Connected.link_expected());
        assert!(!IsolationState::Isolated.link_expected());
        assert!(!IsolationState::EnteringIsolation.link_expected());
    }
}
