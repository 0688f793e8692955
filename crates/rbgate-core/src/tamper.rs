//! Tamper event type.
//!
//! By the time a [`TamperEvent`] exists, autonomous hardware has already
//! power-cut and shorted the key-share memory. The event carries no payload
//! and no recovery field; it only records when software observed the fact.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Key-share memory has been destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperEvent {
    /// Detection time, milliseconds since the Unix epoch.
    pub detected_at_ms: u64,
}

impl TamperEvent {
    /// Creates an event stamped with the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            detected_at_ms: current_time_ms(),
        }
    }

    /// Creates an event with an explicit timestamp.
    #[must_use]
    pub const fn at(detected_at_ms: u64) -> Self {
        Self { detected_at_ms }
    }
}

fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
