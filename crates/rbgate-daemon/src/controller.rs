//! Isolation controller.
//!
//! One task owns the [`IsolationState`] and is the only writer. It waits on
//! four event sources and feeds each event through the transition table:
//!
//! ```text
//!   tamper notification ─┐
//!   sequencer outcome  ──┤  biased select   ┌────────────┐   effects   ┌───────────┐
//!   link frames        ──┼────────────────▶ │ transition │ ──────────▶ │ sequencer │
//!   trusted signals    ──┘  (tamper first)  └────────────┘             │ link      │
//!                                                 │                    └───────────┘
//!                                                 ▼
//!                                        watch<IsolationState> ──▶ PolicyHandle
//! ```
//!
//! Tamper always wins over a queued frame. After tamper the controller keeps
//! running so that an in-flight sequencer outcome is still awaited and
//! logged, but the transition table guarantees it issues no new commands.

use std::sync::Arc;

use rbgate_core::config::PolicyConfig;
use rbgate_core::isolation::{Effect, IsolationState, TransitionEvent, transition};
use rbgate_core::link::{LinkMessage, LinkStats};
use rbgate_core::policy::{OperationClass, PolicyDecision, PowerStatus, evaluate_isolation};
use rbgate_core::switch::SwitchFault;
use rbgate_core::tamper::TamperEvent;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::link::{LinkError, RedBlackLink};
use crate::sequencer::{ControlLines, PendingTransition, PowerSequencer, SequenceOutcome};
use crate::tamper::TamperMonitor;

/// Battery and charger status source for the isolation guard.
pub trait PowerMonitor: Send + Sync + 'static {
    /// Current power status.
    fn power_status(&self) -> PowerStatus;
}

/// Signals raised by the trusted domain's own logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedSignal {
    /// The untrusted domain is up; bring the link up.
    LinkEstablished,
    /// Isolated crypto work finished; rejoin.
    CryptoOperationComplete,
    /// Stop the controller.
    Shutdown,
}

/// Fatal controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The untrusted domain hung up.
    #[error("link transport closed by peer")]
    LinkClosed,

    /// The link transport failed.
    #[error("link failure: {0}")]
    Link(#[from] LinkError),
}

/// Summary returned when the controller stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerReport {
    /// State at shutdown.
    pub final_state: IsolationState,
    /// Link counters at shutdown.
    pub link_stats: LinkStats,
    /// Inbound messages that were valid frames but not allowed from the
    /// untrusted domain.
    pub protocol_faults: u64,
    /// Most recent sequencer fault, if any.
    pub last_fault: Option<SwitchFault>,
}

/// Read-only view of the controller for the crypto/UI layer.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    state: watch::Receiver<IsolationState>,
    tamper: TamperMonitor,
}

impl PolicyHandle {
    /// The most recently published state.
    #[must_use]
    pub fn current_state(&self) -> IsolationState {
        *self.state.borrow()
    }

    /// Returns `true` if `operation` is permitted right now.
    ///
    /// Key-dependent operations are denied once tamper has latched, even
    /// before the controller has processed the notification.
    #[must_use]
    pub fn is_operation_permitted(&self, operation: OperationClass) -> bool {
        if operation.is_key_dependent() && self.tamper.is_latched() {
            return false;
        }
        PolicyDecision::for_state(self.current_state()).permits(operation)
    }

    /// Returns `true` once tamper has latched.
    #[must_use]
    pub fn tamper_latched(&self) -> bool {
        self.tamper.is_latched()
    }

    /// Waits until the published state satisfies `predicate` and returns it.
    ///
    /// Returns `None` if the controller has stopped.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&IsolationState) -> bool,
    ) -> Option<IsolationState> {
        self.state.wait_for(predicate).await.ok().map(|s| *s)
    }
}

/// The isolation controller task.
pub struct IsolationController<L, P, T> {
    state: IsolationState,
    state_tx: watch::Sender<IsolationState>,
    sequencer: PowerSequencer<L>,
    link: RedBlackLink<T>,
    tamper: TamperMonitor,
    power: Arc<P>,
    policy: PolicyConfig,
    signals: mpsc::Receiver<TrustedSignal>,
    pending: Option<PendingTransition>,
    tamper_seen: bool,
    protocol_faults: u64,
    last_fault: Option<SwitchFault>,
}

impl<L, P, T> IsolationController<L, P, T>
where
    L: ControlLines,
    P: PowerMonitor,
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a controller in [`IsolationState::PoweredUp`].
    pub fn new(
        sequencer: PowerSequencer<L>,
        link: RedBlackLink<T>,
        tamper: TamperMonitor,
        power: Arc<P>,
        policy: PolicyConfig,
        signals: mpsc::Receiver<TrustedSignal>,
    ) -> Self {
        let state = IsolationState::default();
        let (state_tx, _) = watch::channel(state);
        Self {
            state,
            state_tx,
            sequencer,
            link,
            tamper,
            power,
            policy,
            signals,
            pending: None,
            tamper_seen: false,
            protocol_faults: 0,
            last_fault: None,
        }
    }

    /// Returns a policy handle bound to this controller.
    #[must_use]
    pub fn policy_handle(&self) -> PolicyHandle {
        PolicyHandle {
            state: self.state_tx.subscribe(),
            tamper: self.tamper.clone(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> IsolationState {
        self.state
    }

    /// Runs the event loop until [`TrustedSignal::Shutdown`] or the signal
    /// channel closes.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the link transport fails.
    pub async fn run(mut self) -> Result<ControllerReport, ControllerError> {
        info!(state = %self.state, "isolation controller started");

        loop {
            let link_ready = self.link.is_enabled();
            let pending_active = self.pending.is_some();

            tokio::select! {
                biased;

                event = self.tamper.notified(), if !self.tamper_seen => {
                    self.latch_tamper(event);
                    self.handle(TransitionEvent::Tamper).await?;
                },

                outcome = await_pending(&mut self.pending), if pending_active => {
                    self.pending = None;
                    let event = self.record_outcome(outcome);
                    self.handle(event).await?;
                },

                received = self.link.receive(), if link_ready => match received {
                    Ok(frame) => {
                        let event = self.event_for(frame.message);
                        debug!(sequence = frame.sequence, %event, "link message");
                        self.handle(event).await?;
                    },
                    Err(LinkError::Disabled) => {},
                    Err(LinkError::Closed) => return Err(ControllerError::LinkClosed),
                    Err(e) => return Err(e.into()),
                },

                signal = self.signals.recv() => match signal {
                    Some(TrustedSignal::LinkEstablished) => {
                        self.handle(TransitionEvent::LinkEstablished).await?;
                    },
                    Some(TrustedSignal::CryptoOperationComplete) => {
                        self.handle(TransitionEvent::CryptoOperationComplete).await?;
                    },
                    Some(TrustedSignal::Shutdown) | None => break,
                },
            }
        }

        if self.pending.is_some() {
            warn!(state = %self.state, "shutting down with a sequencer transition pending");
        }
        info!(state = %self.state, "isolation controller stopped");
        Ok(ControllerReport {
            final_state: self.state,
            link_stats: self.link.stats(),
            protocol_faults: self.protocol_faults,
            last_fault: self.last_fault,
        })
    }

    fn latch_tamper(&mut self, event: TamperEvent) {
        self.tamper_seen = true;
        error!(
            detected_at_ms = event.detected_at_ms,
            state = %self.state,
            "tamper detected; latching"
        );
    }

    fn event_for(&self, message: LinkMessage) -> TransitionEvent {
        match message {
            LinkMessage::IsolationRequest => {
                TransitionEvent::IsolationRequested(evaluate_isolation(
                    self.power.power_status(),
                    &self.policy,
                ))
            },
            LinkMessage::Heartbeat => TransitionEvent::Heartbeat,
            LinkMessage::RejoinRequest => TransitionEvent::RejoinRequested,
            LinkMessage::IsolationAck
            | LinkMessage::IsolationVeto { .. }
            | LinkMessage::RejoinAck => TransitionEvent::UnexpectedMessage(message.kind()),
        }
    }

    fn record_outcome(&mut self, outcome: SequenceOutcome) -> TransitionEvent {
        if self.state == IsolationState::TamperLatched {
            info!(outcome = ?outcome, "sequencer outcome delivered after tamper");
        }
        match outcome {
            SequenceOutcome::Completed => TransitionEvent::SequenceCompleted,
            SequenceOutcome::Faulted(fault) => {
                warn!(
                    code = fault.error_code(),
                    error = %fault,
                    state = %self.state,
                    "sequencer fault"
                );
                self.last_fault = Some(fault);
                TransitionEvent::SequenceFaulted
            },
        }
    }

    /// Applies `event` and carries out the resulting effects in order.
    ///
    /// An effect that cannot start (a rejected sequencer submission) feeds a
    /// `SequenceFaulted` back through the table.
    async fn handle(&mut self, event: TransitionEvent) -> Result<(), ControllerError> {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let t = match transition(self.state, event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "event ignored");
                    return Ok(());
                },
            };

            if t.changed() {
                info!(from = %t.from, to = %t.to, %event, "isolation state changed");
            }
            self.state = t.to;
            self.state_tx.send_replace(self.state);

            for effect in t.effects {
                if let Some(follow_up) = self.execute(effect).await? {
                    next = Some(follow_up);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) -> Result<Option<TransitionEvent>, ControllerError> {
        match effect {
            Effect::Send(message) => {
                // A peer that stops reading must not hold off tamper.
                let sent = tokio::select! {
                    biased;
                    event = self.tamper.notified(), if !self.tamper_seen => {
                        self.latch_tamper(event);
                        warn!(kind = %message.kind(), "send abandoned on tamper");
                        return Ok(Some(TransitionEvent::Tamper));
                    },
                    sent = self.link.send(message) => sent,
                };
                match sent {
                    Ok(frame) => {
                        debug!(sequence = frame.sequence, kind = %message.kind(), "sent");
                    },
                    Err(LinkError::Disabled) => {
                        warn!(kind = %message.kind(), "link disabled; message not sent");
                    },
                    Err(e) => return Err(e.into()),
                }
            },
            Effect::SubmitTarget(target) => match self.sequencer.apply_target(target) {
                Ok(pending) => self.pending = Some(pending),
                Err(e) => {
                    error!(error = %e, %target, "sequencer rejected target");
                    return Ok(Some(TransitionEvent::SequenceFaulted));
                },
            },
            Effect::ForceIsolatorsDisabled => {
                self.sequencer.force_isolators_disabled();
                error!(
                    state = %self.state,
                    fault = self.last_fault.as_ref().map(SwitchFault::error_code),
                    "safe fault: isolators disabled, awaiting reset"
                );
            },
            Effect::RecordProtocolFault => {
                self.protocol_faults = self.protocol_faults.saturating_add(1);
                warn!(
                    state = %self.state,
                    total = self.protocol_faults,
                    "protocol fault: message not permitted from untrusted domain"
                );
            },
        }
        Ok(None)
    }
}

async fn await_pending(pending: &mut Option<PendingTransition>) -> SequenceOutcome {
    match pending {
        Some(p) => p.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use rbgate_core::isolation::RejoinPhase;

    use super::*;
    use crate::tamper::tamper_channel;

    fn handle_for(state: IsolationState) -> (watch::Sender<IsolationState>, PolicyHandle) {
        let (tx, rx) = watch::channel(state);
        let (_input, tamper) = tamper_channel();
        (tx, PolicyHandle { state: rx, tamper })
    }

    #[test]
    fn test_policy_follows_published_state() {
        let (tx, handle) = handle_for(IsolationState::Connected);
        assert!(handle.is_operation_permitted(OperationClass::CryptoForwarding));
        assert!(!handle.is_operation_permitted(OperationClass::Signing));

        tx.send_replace(IsolationState::Isolated);
        assert!(handle.is_operation_permitted(OperationClass::Signing));
        assert!(!handle.is_operation_permitted(OperationClass::UsbComposite));

        tx.send_replace(IsolationState::Rejoining {
            phase: RejoinPhase::Settling,
        });
        assert!(!handle.is_operation_permitted(OperationClass::Signing));
        assert!(handle.is_operation_permitted(OperationClass::StatusDisplay));
    }

    #[test]
    fn test_tamper_denies_key_operations_before_state_update() {
        let (tx, rx) = watch::channel(IsolationState::Isolated);
        let (input, tamper) = tamper_channel();
        let handle = PolicyHandle { state: rx, tamper };

        input.assert_edge();
        assert!(handle.tamper_latched());
        assert_eq!(handle.current_state(), IsolationState::Isolated);
        for op in OperationClass::ALL {
            assert_eq!(
                handle.is_operation_permitted(op),
                !op.is_key_dependent(),
                "{op}"
            );
        }
        drop(tx);
    }
}
