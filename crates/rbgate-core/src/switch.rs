//! Switch model and step planning for the power sequencer.
//!
//! A [`SwitchSet`] is the commanded configuration of the three isolation
//! actuators: the charge-path switch, the ground-path switch, and the
//! data/control isolators. Transitions between configurations are planned as
//! an ordered list of [`SequenceStep`]s.
//!
//! # Ordering
//!
//! ```text
//! entering isolation:  DisableIsolators -> OpenCharge -> OpenGround
//! rejoining:           CloseGround -> CloseCharge
//!                      -> Settle -> AwaitRailsNominal -> EnableIsolators
//! ```
//!
//! # Invariants
//!
//! - [INV-SW001] Ground may be open only while charge is also open.
//! - [INV-SW002] Isolators may be enabled only while both switches are
//!   closed.
//! - [INV-SW003] `EnableIsolators` is always preceded by `Settle` and
//!   `AwaitRailsNominal` in the same plan.
//! - [INV-SW004] `DisableIsolators` is always the first step of any plan that
//!   opens a switch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a power-path switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPosition {
    /// Conducting.
    Closed,
    /// Not conducting.
    Open,
}

impl SwitchPosition {
    /// Returns `true` if the switch is open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns the position as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for SwitchPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enable status of the data/control isolators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolatorState {
    /// Isolators pass data between domains.
    Enabled,
    /// Isolators block all data between domains.
    Disabled,
}

impl IsolatorState {
    /// Returns `true` if the isolators are enabled.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Returns the status as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for IsolatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commanded (or observed) configuration of the isolation actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwitchSet {
    /// Charge-path switch.
    pub charge: SwitchPosition,
    /// Ground-path switch.
    pub ground: SwitchPosition,
    /// Data/control isolators.
    pub isolators: IsolatorState,
}

impl SwitchSet {
    /// Both paths closed, isolators enabled. The normal connected setup.
    #[must_use]
    pub const fn connected() -> Self {
        Self {
            charge: SwitchPosition::Closed,
            ground: SwitchPosition::Closed,
            isolators: IsolatorState::Enabled,
        }
    }

    /// Both paths open, isolators disabled.
    #[must_use]
    pub const fn isolated() -> Self {
        Self {
            charge: SwitchPosition::Open,
            ground: SwitchPosition::Open,
            isolators: IsolatorState::Disabled,
        }
    }

    /// Both paths closed, isolators still disabled.
    ///
    /// This is also the hardware default at power-up.
    #[must_use]
    pub const fn rejoin() -> Self {
        Self {
            charge: SwitchPosition::Closed,
            ground: SwitchPosition::Closed,
            isolators: IsolatorState::Disabled,
        }
    }

    /// Returns `true` if both switches are closed.
    #[must_use]
    pub const fn both_closed(&self) -> bool {
        !self.charge.is_open() && !self.ground.is_open()
    }

    /// Checks the structural invariants of this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchSetViolation`] if the ground path is open while the
    /// charge path is closed, or if isolators are enabled while either switch
    /// is open.
    pub const fn validate(&self) -> Result<(), SwitchSetViolation> {
        if self.ground.is_open() && !self.charge.is_open() {
            return Err(SwitchSetViolation::GroundOnlyOpen);
        }
        if self.isolators.is_enabled() && !self.both_closed() {
            return Err(SwitchSetViolation::IsolatorsEnabledWhileOpen);
        }
        Ok(())
    }
}

impl fmt::Display for SwitchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{charge={}, ground={}, isolators={}}}",
            self.charge, self.ground, self.isolators
        )
    }
}

/// Structural violation of a [`SwitchSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwitchSetViolation {
    /// Ground path open with charge path closed.
    #[error("ground path may only be open while charge path is open")]
    GroundOnlyOpen,
    /// Isolators enabled while a switch is open.
    #[error("isolators may only be enabled while both switches are closed")]
    IsolatorsEnabledWhileOpen,
}

/// One bounded sub-step of a sequencer transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStep {
    /// De-assert the isolator enable line.
    DisableIsolators,
    /// Open the charge-path switch.
    OpenCharge,
    /// Open the ground-path switch.
    OpenGround,
    /// Close the ground-path switch.
    CloseGround,
    /// Close the charge-path switch.
    CloseCharge,
    /// Wait out the settle interval.
    Settle,
    /// Wait for the rails to report nominal.
    AwaitRailsNominal,
    /// Assert the isolator enable line.
    EnableIsolators,
}

impl SequenceStep {
    /// Returns the step name as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DisableIsolators => "disable_isolators",
            Self::OpenCharge => "open_charge",
            Self::OpenGround => "open_ground",
            Self::CloseGround => "close_ground",
            Self::CloseCharge => "close_charge",
            Self::Settle => "settle",
            Self::AwaitRailsNominal => "await_rails_nominal",
            Self::EnableIsolators => "enable_isolators",
        }
    }

    /// Applies the commanded effect of this step to `set`.
    ///
    /// Timing steps leave the set unchanged.
    #[must_use]
    pub const fn apply(self, mut set: SwitchSet) -> SwitchSet {
        match self {
            Self::DisableIsolators => set.isolators = IsolatorState::Disabled,
            Self::OpenCharge => set.charge = SwitchPosition::Open,
            Self::OpenGround => set.ground = SwitchPosition::Open,
            Self::CloseGround => set.ground = SwitchPosition::Closed,
            Self::CloseCharge => set.charge = SwitchPosition::Closed,
            Self::EnableIsolators => set.isolators = IsolatorState::Enabled,
            Self::Settle | Self::AwaitRailsNominal => {},
        }
        set
    }
}

impl fmt::Display for SequenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plans the ordered steps that take the actuators from `from` to `to`.
///
/// Both sets must already satisfy [`SwitchSet::validate`]. An empty plan
/// means `from == to`.
#[must_use]
pub fn plan_steps(from: SwitchSet, to: SwitchSet) -> Vec<SequenceStep> {
    let mut steps = Vec::with_capacity(8);

    let opens_charge = !from.charge.is_open() && to.charge.is_open();
    let opens_ground = !from.ground.is_open() && to.ground.is_open();
    let closes_charge = from.charge.is_open() && !to.charge.is_open();
    let closes_ground = from.ground.is_open() && !to.ground.is_open();

    // Isolators come down before anything opens, and whenever the target
    // asks for them disabled.
    if from.isolators.is_enabled()
        && (!to.isolators.is_enabled() || opens_charge || opens_ground)
    {
        steps.push(SequenceStep::DisableIsolators);
    }

    if opens_charge {
        steps.push(SequenceStep::OpenCharge);
    }
    if opens_ground {
        steps.push(SequenceStep::OpenGround);
    }
    if closes_ground {
        steps.push(SequenceStep::CloseGround);
    }
    if closes_charge {
        steps.push(SequenceStep::CloseCharge);
    }

    let isolators_down_after = steps.contains(&SequenceStep::DisableIsolators)
        || !from.isolators.is_enabled();
    if to.isolators.is_enabled() && isolators_down_after {
        steps.push(SequenceStep::Settle);
        steps.push(SequenceStep::AwaitRailsNominal);
        steps.push(SequenceStep::EnableIsolators);
    }

    steps
}

/// Picks the configuration a new plan toward `target` starts from.
///
/// A line whose commanded and observed positions agree is taken as-is. A
/// line that disagrees (driven but never confirmed, or moving late) is taken
/// as the opposite of `target`, so the plan drives it again.
#[must_use]
pub const fn plan_origin(
    commanded: SwitchSet,
    observed: SwitchSet,
    target: SwitchSet,
) -> SwitchSet {
    const fn switch(
        commanded: SwitchPosition,
        observed: SwitchPosition,
        target: SwitchPosition,
    ) -> SwitchPosition {
        if commanded.is_open() == observed.is_open() {
            commanded
        } else if target.is_open() {
            SwitchPosition::Closed
        } else {
            SwitchPosition::Open
        }
    }

    let isolators = if commanded.isolators.is_enabled() == observed.isolators.is_enabled() {
        commanded.isolators
    } else if target.isolators.is_enabled() {
        IsolatorState::Disabled
    } else {
        IsolatorState::Enabled
    };

    SwitchSet {
        charge: switch(commanded.charge, observed.charge, target.charge),
        ground: switch(commanded.ground, observed.ground, target.ground),
        isolators,
    }
}

/// Power sequencer fault. Always fatal to the in-flight transition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SwitchFault {
    /// A line did not reach its commanded position in time.
    #[error("step {step} did not complete within {after_ms}ms")]
    Timeout {
        /// The step that timed out.
        step: SequenceStep,
        /// The bound that was exceeded.
        after_ms: u64,
    },

    /// Final readback disagrees with the commanded target.
    #[error("readback {observed} does not match commanded {expected}")]
    UnexpectedReadback {
        /// Commanded configuration.
        expected: SwitchSet,
        /// Observed configuration.
        observed: SwitchSet,
    },

    /// Rails did not report nominal after settling.
    #[error("rails not nominal within {after_ms}ms")]
    RailsNotNominal {
        /// The bound that was exceeded.
        after_ms: u64,
    },

    /// The sequencer task ended without reporting an outcome.
    #[error("sequencer task lost before transition to {target} finished")]
    TaskLost {
        /// The target of the abandoned transition.
        target: SwitchSet,
    },
}

impl SwitchFault {
    /// Returns the machine-readable error code for this fault.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "SWITCH_TIMEOUT",
            Self::UnexpectedReadback { .. } => "SWITCH_UNEXPECTED_READBACK",
            Self::RailsNotNominal { .. } => "RAILS_NOT_NOMINAL",
            Self::TaskLost { .. } => "SEQUENCER_TASK_LOST",
        }
    }
}
