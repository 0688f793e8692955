//! Tamper monitor.
//!
//! The hardware kill path acts on its own: by the time software hears about
//! tamper, power is already cut and the key-share memory is shorted. This
//! module only carries that fact from the edge interrupt to the controller.
//!
//! ```text
//!   edge ISR ──assert_edge()──▶ [latched flag + event] ──notify──▶ notified().await
//! ```
//!
//! # Invariants
//!
//! - [INV-TM001] Once latched, every reader observes the latch for the
//!   lifetime of the process. There is no reset, arm or disarm.
//! - [INV-TM002] An edge asserted while nobody waits is not lost: a later
//!   [`TamperMonitor::notified`] resolves immediately.
//! - [INV-TM003] Repeated edges are idempotent; the first timestamp is kept.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use rbgate_core::tamper::TamperEvent;
use tokio::sync::Notify;
use tracing::error;

#[derive(Debug, Default)]
struct Shared {
    event: OnceLock<TamperEvent>,
    latched: AtomicBool,
    notify: Notify,
}

/// Creates a connected tamper input and monitor.
#[must_use]
pub fn tamper_channel() -> (TamperInput, TamperMonitor) {
    let shared = Arc::new(Shared::default());
    (
        TamperInput {
            shared: Arc::clone(&shared),
        },
        TamperMonitor { shared },
    )
}

/// Hardware side of the tamper channel.
///
/// Safe to call from any thread, including outside the async runtime.
#[derive(Debug, Clone)]
pub struct TamperInput {
    shared: Arc<Shared>,
}

impl TamperInput {
    /// Records the tamper edge. Idempotent.
    pub fn assert_edge(&self) {
        self.assert_edge_at(TamperEvent::now());
    }

    /// Records the tamper edge with an explicit event.
    pub fn assert_edge_at(&self, event: TamperEvent) {
        if self.shared.event.set(event).is_err() {
            return;
        }
        self.shared.latched.store(true, Ordering::Release);
        error!(
            detected_at_ms = event.detected_at_ms,
            "tamper edge asserted; key-share memory destroyed"
        );
        self.shared.notify.notify_waiters();
    }
}

/// Software side of the tamper channel.
#[derive(Debug, Clone)]
pub struct TamperMonitor {
    shared: Arc<Shared>,
}

impl TamperMonitor {
    /// Returns `true` once tamper has been observed.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.shared.latched.load(Ordering::Acquire)
    }

    /// The latched event, if any.
    #[must_use]
    pub fn event(&self) -> Option<TamperEvent> {
        if self.is_latched() {
            self.shared.event.get().copied()
        } else {
            None
        }
    }

    /// Waits for the tamper edge.
    ///
    /// Resolves immediately if tamper has already latched.
    pub async fn notified(&self) -> TamperEvent {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.event() {
                return event;
            }
            notified.await;
        }
    }
}
