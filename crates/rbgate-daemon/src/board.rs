//! Simulated isolation board.
//!
//! An in-memory stand-in for the charge/ground switches, the isolator enable
//! line, the rail monitor and the battery gauge. Lines follow their drive
//! commands immediately unless jammed.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use rbgate_core::policy::PowerStatus;
use rbgate_core::switch::{IsolatorState, SwitchPosition, SwitchSet};

use crate::controller::PowerMonitor;
use crate::sequencer::ControlLines;

/// One controllable line on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    /// Charge-path switch.
    Charge,
    /// Ground-path switch.
    Ground,
    /// Isolator enable.
    Isolators,
}

/// In-memory board implementing [`ControlLines`] and [`PowerMonitor`].
#[derive(Debug)]
pub struct SimulatedBoard {
    charge_open: AtomicBool,
    ground_open: AtomicBool,
    isolators_enabled: AtomicBool,
    charge_jammed: AtomicBool,
    ground_jammed: AtomicBool,
    isolators_jammed: AtomicBool,
    rails_nominal: AtomicBool,
    battery_percent: AtomicU8,
    charging: AtomicBool,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// Creates a board in the power-up hardware default: both paths closed,
    /// isolators disabled, rails nominal, battery full and not charging.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            charge_open: AtomicBool::new(false),
            ground_open: AtomicBool::new(false),
            isolators_enabled: AtomicBool::new(false),
            charge_jammed: AtomicBool::new(false),
            ground_jammed: AtomicBool::new(false),
            isolators_jammed: AtomicBool::new(false),
            rails_nominal: AtomicBool::new(true),
            battery_percent: AtomicU8::new(100),
            charging: AtomicBool::new(false),
        }
    }

    /// Creates a board reporting `status` from its power monitor.
    #[must_use]
    pub fn with_power(status: PowerStatus) -> Self {
        let board = Self::new();
        board.set_power(status);
        board
    }

    /// Makes `line` ignore further drive commands.
    pub fn jam(&self, line: Line) {
        self.jam_flag(line).store(true, Ordering::Release);
    }

    /// Lets `line` follow drive commands again.
    pub fn unjam(&self, line: Line) {
        self.jam_flag(line).store(false, Ordering::Release);
    }

    /// Sets whether the rails report nominal.
    pub fn set_rails_nominal(&self, nominal: bool) {
        self.rails_nominal.store(nominal, Ordering::Release);
    }

    /// Sets the reported battery and charger status.
    pub fn set_power(&self, status: PowerStatus) {
        self.battery_percent
            .store(status.battery_percent.min(100), Ordering::Release);
        self.charging.store(status.charging, Ordering::Release);
    }

    const fn jam_flag(&self, line: Line) -> &AtomicBool {
        match line {
            Line::Charge => &self.charge_jammed,
            Line::Ground => &self.ground_jammed,
            Line::Isolators => &self.isolators_jammed,
        }
    }

    fn drive(&self, line: Line, flag: &AtomicBool, value: bool) {
        if !self.jam_flag(line).load(Ordering::Acquire) {
            flag.store(value, Ordering::Release);
        }
    }
}

impl ControlLines for SimulatedBoard {
    fn drive_charge(&self, position: SwitchPosition) {
        self.drive(Line::Charge, &self.charge_open, position.is_open());
    }

    fn drive_ground(&self, position: SwitchPosition) {
        self.drive(Line::Ground, &self.ground_open, position.is_open());
    }

    fn drive_isolators(&self, state: IsolatorState) {
        self.drive(Line::Isolators, &self.isolators_enabled, state.is_enabled());
    }

    fn readback(&self) -> SwitchSet {
        let position = |open: &AtomicBool| {
            if open.load(Ordering::Acquire) {
                SwitchPosition::Open
            } else {
                SwitchPosition::Closed
            }
        };
        SwitchSet {
            charge: position(&self.charge_open),
            ground: position(&self.ground_open),
            isolators: if self.isolators_enabled.load(Ordering::Acquire) {
                IsolatorState::Enabled
            } else {
                IsolatorState::Disabled
            },
        }
    }

    fn rails_nominal(&self) -> bool {
        self.rails_nominal.load(Ordering::Acquire)
    }
}

impl PowerMonitor for SimulatedBoard {
    fn power_status(&self) -> PowerStatus {
        PowerStatus {
            battery_percent: self.battery_percent.load(Ordering::Acquire),
            charging: self.charging.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_up_default() {
        let board = SimulatedBoard::new();
        assert_eq!(board.readback(), SwitchSet::rejoin());
        assert!(board.rails_nominal());
    }

    #[test]
    fn test_jammed_line_ignores_drive() {
        let board = SimulatedBoard::new();
        board.jam(Line::Ground);
        board.drive_ground(SwitchPosition::Open);
        board.drive_charge(SwitchPosition::Open);
        let set = board.readback();
        assert!(set.charge.is_open());
        assert!(!set.ground.is_open());

        board.unjam(Line::Ground);
        board.drive_ground(SwitchPosition::Open);
        assert!(board.readback().ground.is_open());
    }

    #[test]
    fn test_power_status_clamped() {
        let board = SimulatedBoard::with_power(PowerStatus {
            battery_percent: 150,
            charging: true,
        });
        assert_eq!(
            board.power_status(),
            PowerStatus {
                battery_percent: 100,
                charging: true,
            }
        );
    }
}
