//! Power sequencer.
//!
//! Drives the charge-path switch, the ground-path switch and the data-link
//! isolators from one commanded [`SwitchSet`] to another. Each transition is
//! planned with [`plan_steps`] and executed on a spawned task; the caller
//! receives a [`PendingTransition`] that resolves to exactly one
//! [`SequenceOutcome`].
//!
//! # Ordering
//!
//! ```text
//! opening:  DisableIsolators -> OpenCharge -> OpenGround
//! closing:  CloseGround -> CloseCharge -> Settle -> AwaitRailsNominal -> EnableIsolators
//! ```
//!
//! The link gate is closed before the isolator line is driven low and opened
//! only after the isolator readback confirms enabled.
//!
//! # Invariants
//!
//! - [INV-SQ001] At most one transition is in flight; a second
//!   [`PowerSequencer::apply_target`] returns [`SequencerError::Busy`].
//! - [INV-SQ002] Every line step is bounded by the step timeout and the
//!   rails wait by the rails timeout. There are no retries.
//! - [INV-SQ003] After [`PowerSequencer::force_isolators_disabled`], no
//!   later step re-enables the isolators.
//! - [INV-SQ004] The commanded set records a line as soon as it is driven.
//!   Plans start from [`plan_origin`], so a line that was driven but never
//!   confirmed is driven again.
//! - [INV-SQ005] The isolators are driven enabled only while readback shows
//!   both switches closed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use rbgate_core::config::SequencerConfig;
use rbgate_core::switch::{
    IsolatorState, SequenceStep, SwitchFault, SwitchPosition, SwitchSet, SwitchSetViolation,
    plan_origin, plan_steps,
};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::link::LinkGate;

/// Hardware access to the isolation actuators.
///
/// Drive calls command a line; [`Self::readback`] reports what the hardware
/// actually shows. Implementations must not block.
pub trait ControlLines: Send + Sync + 'static {
    /// Drives the charge-path switch.
    fn drive_charge(&self, position: SwitchPosition);

    /// Drives the ground-path switch.
    fn drive_ground(&self, position: SwitchPosition);

    /// Drives the isolator enable line.
    fn drive_isolators(&self, state: IsolatorState);

    /// Reads back the current line positions.
    fn readback(&self) -> SwitchSet;

    /// Returns `true` once the shared rails are within tolerance.
    fn rails_nominal(&self) -> bool;
}

/// Final result of one sequencer transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Readback matches the target.
    Completed,
    /// The transition stopped at a fault.
    Faulted(SwitchFault),
}

impl SequenceOutcome {
    /// Returns `true` for [`SequenceOutcome::Completed`].
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Errors returned synchronously by [`PowerSequencer::apply_target`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    /// A transition is already in flight.
    #[error("a sequencer transition is already pending")]
    Busy,

    /// The target violates a switch invariant.
    #[error("invalid target {target}: {violation}")]
    InvalidTarget {
        /// The rejected target.
        target: SwitchSet,
        /// The violated invariant.
        violation: SwitchSetViolation,
    },
}

/// A submitted transition. Resolves once, when the transition ends.
#[derive(Debug)]
#[must_use = "a pending transition does nothing unless awaited"]
pub struct PendingTransition {
    target: SwitchSet,
    rx: oneshot::Receiver<SequenceOutcome>,
}

impl PendingTransition {
    /// The commanded target.
    #[must_use]
    pub const fn target(&self) -> SwitchSet {
        self.target
    }
}

impl Future for PendingTransition {
    type Output = SequenceOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let target = self.target;
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            // A dropped sender means the task died before finishing.
            result.unwrap_or(SequenceOutcome::Faulted(SwitchFault::TaskLost { target }))
        })
    }
}

struct Inner<L> {
    lines: Arc<L>,
    config: SequencerConfig,
    gate: LinkGate,
    commanded: watch::Sender<SwitchSet>,
    busy: AtomicBool,
    isolators_inhibited: AtomicBool,
}

/// Ordered, time-bounded driver for the isolation actuators.
pub struct PowerSequencer<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for PowerSequencer<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ControlLines> PowerSequencer<L> {
    /// Creates a sequencer. The commanded set starts at the power-up
    /// hardware default, [`SwitchSet::rejoin`].
    pub fn new(lines: Arc<L>, config: SequencerConfig, gate: LinkGate) -> Self {
        let (commanded, _) = watch::channel(SwitchSet::rejoin());
        Self {
            inner: Arc::new(Inner {
                lines,
                config,
                gate,
                commanded,
                busy: AtomicBool::new(false),
                isolators_inhibited: AtomicBool::new(false),
            }),
        }
    }

    /// The last commanded configuration.
    #[must_use]
    pub fn commanded(&self) -> SwitchSet {
        *self.inner.commanded.borrow()
    }

    /// Returns `true` while a transition is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Starts a transition to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::InvalidTarget`] if `target` fails
    /// [`SwitchSet::validate`], or [`SequencerError::Busy`] if a transition
    /// is already pending.
    pub fn apply_target(&self, target: SwitchSet) -> Result<PendingTransition, SequencerError> {
        target
            .validate()
            .map_err(|violation| SequencerError::InvalidTarget { target, violation })?;

        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SequencerError::Busy);
        }

        let commanded = self.commanded();
        let observed = self.inner.lines.readback();
        let from = plan_origin(commanded, observed, target);
        if from != commanded {
            warn!(%commanded, %observed, "readback disagrees with commanded lines");
        }
        let steps = plan_steps(from, target);
        info!(%from, %target, steps = steps.len(), "sequencer transition started");

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = match inner.run(&steps, target).await {
                Ok(()) => SequenceOutcome::Completed,
                Err(fault) => {
                    warn!(code = fault.error_code(), error = %fault, "sequencer transition faulted");
                    SequenceOutcome::Faulted(fault)
                },
            };
            inner.busy.store(false, Ordering::Release);
            // The receiver may have been dropped; the outcome is logged above.
            let _ = tx.send(outcome);
        });

        Ok(PendingTransition { target, rx })
    }

    /// Drives the isolators disabled and closes the link gate immediately,
    /// regardless of any pending transition. No later step re-enables them.
    pub fn force_isolators_disabled(&self) {
        self.inner.isolators_inhibited.store(true, Ordering::Release);
        self.inner.gate.disable();
        self.inner.lines.drive_isolators(IsolatorState::Disabled);
        self.inner.commanded.send_modify(|set| {
            set.isolators = IsolatorState::Disabled;
        });
        warn!("isolators forced disabled");
    }
}

impl<L: ControlLines> Inner<L> {
    async fn run(&self, steps: &[SequenceStep], target: SwitchSet) -> Result<(), SwitchFault> {
        for &step in steps {
            debug!(%step, "sequencer step");
            self.execute(step, target).await?;
        }

        let observed = self.lines.readback();
        if observed != target {
            return Err(SwitchFault::UnexpectedReadback {
                expected: target,
                observed,
            });
        }
        info!(%target, "sequencer transition completed");
        Ok(())
    }

    async fn execute(&self, step: SequenceStep, target: SwitchSet) -> Result<(), SwitchFault> {
        match step {
            SequenceStep::DisableIsolators => {
                self.gate.disable();
                self.lines.drive_isolators(IsolatorState::Disabled);
                self.record(step);
                self.await_line(step, |r| !r.isolators.is_enabled()).await
            },
            SequenceStep::OpenCharge => {
                self.lines.drive_charge(SwitchPosition::Open);
                self.record(step);
                self.await_line(step, |r| r.charge.is_open()).await
            },
            SequenceStep::OpenGround => {
                self.lines.drive_ground(SwitchPosition::Open);
                self.record(step);
                self.await_line(step, |r| r.ground.is_open()).await
            },
            SequenceStep::CloseGround => {
                self.lines.drive_ground(SwitchPosition::Closed);
                self.record(step);
                self.await_line(step, |r| !r.ground.is_open()).await
            },
            SequenceStep::CloseCharge => {
                self.lines.drive_charge(SwitchPosition::Closed);
                self.record(step);
                self.await_line(step, |r| !r.charge.is_open()).await
            },
            SequenceStep::Settle => {
                tokio::time::sleep(self.config.settle_interval()).await;
                Ok(())
            },
            SequenceStep::AwaitRailsNominal => {
                let timeout = self.config.rails_timeout();
                self.poll_until(timeout, || self.lines.rails_nominal())
                    .await
                    .map_err(|()| SwitchFault::RailsNotNominal {
                        after_ms: millis(timeout),
                    })
            },
            SequenceStep::EnableIsolators => {
                if self.isolators_inhibited.load(Ordering::Acquire) {
                    warn!("isolator enable suppressed after forced disable");
                    return Ok(());
                }
                let observed = self.lines.readback();
                if !observed.both_closed() {
                    return Err(SwitchFault::UnexpectedReadback {
                        expected: target,
                        observed,
                    });
                }
                self.lines.drive_isolators(IsolatorState::Enabled);
                self.record(step);
                self.await_line(step, |r| r.isolators.is_enabled()).await?;
                self.gate.enable();
                Ok(())
            },
        }
    }

    fn record(&self, step: SequenceStep) {
        self.commanded.send_modify(|set| *set = step.apply(*set));
    }

    async fn await_line(
        &self,
        step: SequenceStep,
        reached: impl Fn(SwitchSet) -> bool,
    ) -> Result<(), SwitchFault> {
        let timeout = self.config.step_timeout();
        self.poll_until(timeout, || reached(self.lines.readback()))
            .await
            .map_err(|()| SwitchFault::Timeout {
                step,
                after_ms: millis(timeout),
            })
    }

    async fn poll_until(&self, timeout: Duration, check: impl Fn() -> bool) -> Result<(), ()> {
        let interval = self.config.poll_interval();
        let poll = async {
            while !check() {
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| ())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
