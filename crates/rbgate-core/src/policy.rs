//! Operation policy derived from the isolation state.
//!
//! A [`PolicyDecision`] is recomputed from the current [`IsolationState`] on
//! every query. It is never cached across a transition, so a round trip
//! through isolation always lands on the same permissions it started from.
//!
//! This module also evaluates the isolation guard: whether an
//! `IsolationRequest` may be honoured given the current power status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::isolation::IsolationState;

/// Classes of operation exposed to the crypto/UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Signing with a device key.
    Signing,
    /// Unwrapping a stored key share.
    KeyUnwrap,
    /// Forwarding crypto requests received from the untrusted domain.
    CryptoForwarding,
    /// USB composite roles on the untrusted side.
    UsbComposite,
    /// Battery charging from the USB rail.
    Charging,
    /// Rendering device status to the operator.
    StatusDisplay,
}

impl OperationClass {
    /// All operation classes, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Signing,
        Self::KeyUnwrap,
        Self::CryptoForwarding,
        Self::UsbComposite,
        Self::Charging,
        Self::StatusDisplay,
    ];

    /// Returns `true` if the operation depends on key material.
    #[must_use]
    pub const fn is_key_dependent(self) -> bool {
        matches!(
            self,
            Self::Signing | Self::KeyUnwrap | Self::CryptoForwarding
        )
    }

    /// Returns the class name as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signing => "signing",
            Self::KeyUnwrap => "key_unwrap",
            Self::CryptoForwarding => "crypto_forwarding",
            Self::UsbComposite => "usb_composite",
            Self::Charging => "charging",
            Self::StatusDisplay => "status_display",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STATUS_ONLY: &[OperationClass] = &[OperationClass::StatusDisplay];

const CONNECTED: &[OperationClass] = &[
    OperationClass::CryptoForwarding,
    OperationClass::UsbComposite,
    OperationClass::Charging,
    OperationClass::StatusDisplay,
];

const ISOLATED: &[OperationClass] = &[
    OperationClass::Signing,
    OperationClass::KeyUnwrap,
    OperationClass::StatusDisplay,
];

/// Permitted operations for one isolation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    permitted: &'static [OperationClass],
}

impl PolicyDecision {
    /// Derives the decision for `state`.
    #[must_use]
    pub const fn for_state(state: IsolationState) -> Self {
        let permitted = match state {
            IsolationState::Connected => CONNECTED,
            IsolationState::Isolated => ISOLATED,
            IsolationState::PoweredUp
            | IsolationState::BringingUp
            | IsolationState::EnteringIsolation
            | IsolationState::Rejoining { .. }
            | IsolationState::SafeFault { .. }
            | IsolationState::TamperLatched => STATUS_ONLY,
        };
        Self { permitted }
    }

    /// Returns `true` if `operation` is permitted.
    #[must_use]
    pub fn permits(&self, operation: OperationClass) -> bool {
        self.permitted.contains(&operation)
    }

    /// Returns the permitted operations.
    #[must_use]
    pub const fn permitted(&self) -> &'static [OperationClass] {
        self.permitted
    }
}

/// Battery and charger status reported by the power-management collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStatus {
    /// Remaining battery charge, 0-100.
    pub battery_percent: u8,
    /// Whether the charger is actively charging.
    pub charging: bool,
}

/// Reason the trusted domain declined an isolation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoReason {
    /// Charging is in progress.
    ChargingInProgress,
    /// Battery is below the isolation-safe threshold.
    BatteryLow,
    /// Reason not representable by this build.
    Unspecified,
}

impl VetoReason {
    /// Wire code for this reason.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::ChargingInProgress => 0x01,
            Self::BatteryLow => 0x02,
            Self::Unspecified => 0xFF,
        }
    }

    /// Parses a wire code. Unknown codes map to `Unspecified`.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::ChargingInProgress,
            0x02 => Self::BatteryLow,
            _ => Self::Unspecified,
        }
    }

    /// Returns the reason as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChargingInProgress => "charging_in_progress",
            Self::BatteryLow => "battery_low",
            Self::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the isolation guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationVerdict {
    /// Isolation may begin now.
    Permit,
    /// Isolation is declined.
    Veto(VetoReason),
}

/// Evaluates whether isolation may begin given `status`.
///
/// Charging is checked before battery level so a device on the charger is
/// always reported as charging.
#[must_use]
pub const fn evaluate_isolation(status: PowerStatus, config: &PolicyConfig) -> IsolationVerdict {
    if config.veto_while_charging && status.charging {
        return IsolationVerdict::Veto(VetoReason::ChargingInProgress);
    }
    if status.battery_percent < config.min_isolation_battery_percent {
        return IsolationVerdict::Veto(VetoReason::BatteryLow);
    }
    IsolationVerdict::Permit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::RejoinPhase;

    fn policy() -> PolicyConfig {
        PolicyConfig {
            min_isolation_battery_percent: 20,
            veto_while_charging: true,
        }
    }

    #[test]
    fn test_key_dependent_classes() {
        assert!(OperationClass::Signing.is_key_dependent());
        assert!(OperationClass::KeyUnwrap.is_key_dependent());
        assert!(OperationClass::CryptoForwarding.is_key_dependent());
        assert!(!OperationClass::UsbComposite.is_key_dependent());
        assert!(!OperationClass::StatusDisplay.is_key_dependent());
    }

    #[test]
    fn test_isolated_permits_signing_only_there() {
        assert!(PolicyDecision::for_state(IsolationState::Isolated).permits(OperationClass::Signing));
        assert!(
            !PolicyDecision::for_state(IsolationState::Connected)
                .permits(OperationClass::Signing)
        );
    }

    #[test]
    fn test_transitional_states_permit_status_only() {
        for state in [
            IsolationState::PoweredUp,
            IsolationState::BringingUp,
            IsolationState::EnteringIsolation,
            IsolationState::Rejoining {
                phase: RejoinPhase::Settling,
            },
            IsolationState::TamperLatched,
        ] {
            let decision = PolicyDecision::for_state(state);
            assert_eq!(decision.permitted(), &[OperationClass::StatusDisplay]);
        }
    }

    #[test]
    fn test_tamper_latched_denies_all_key_dependent() {
        let decision = PolicyDecision::for_state(IsolationState::TamperLatched);
        for op in OperationClass::ALL {
            if op.is_key_dependent() {
                assert!(!decision.permits(op), "{op} permitted after tamper");
            }
        }
    }

    #[test]
    fn test_veto_when_charging() {
        let status = PowerStatus {
            battery_percent: 90,
            charging: true,
        };
        assert_eq!(
            evaluate_isolation(status, &policy()),
            IsolationVerdict::Veto(VetoReason::ChargingInProgress)
        );
    }

    #[test]
    fn test_veto_when_battery_low() {
        let status = PowerStatus {
            battery_percent: 19,
            charging: false,
        };
        assert_eq!(
            evaluate_isolation(status, &policy()),
            IsolationVerdict::Veto(VetoReason::BatteryLow)
        );
    }

    #[test]
    fn test_permit_at_threshold() {
        let status = PowerStatus {
            battery_percent: 20,
            charging: false,
        };
        assert_eq!(evaluate_isolation(status, &policy()), IsolationVerdict::Permit);
    }

    #[test]
    fn test_charging_allowed_when_configured() {
        let mut config = policy();
        config.veto_while_charging = false;
        let status = PowerStatus {
            battery_percent: 80,
            charging: true,
        };
        assert_eq!(evaluate_isolation(status, &config), IsolationVerdict::Permit);
    }

    #[test]
    fn test_veto_reason_code_roundtrip() {
        for reason in [VetoReason::ChargingInProgress, VetoReason::BatteryLow] {
            assert_eq!(VetoReason::from_code(reason.code()), reason);
        }
        assert_eq!(VetoReason::from_code(0x42), VetoReason::Unspecified);
    }
}
