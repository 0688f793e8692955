//! Red-black link channel.
//!
//! Frames travel over a length-delimited transport on any byte stream (a Unix
//! socket in the daemon, an in-memory duplex in tests). Every inbound frame
//! passes the [`FrameValidator`] before the controller sees it; rejected
//! frames are counted, logged and dropped here.
//!
//! Whether the link may carry traffic at all is decided by the [`LinkGate`],
//! which only the power sequencer drives, in step with the isolator line.
//!
//! # Invariants
//!
//! - [INV-LK001] While the gate is disabled, [`RedBlackLink::send`] and
//!   [`RedBlackLink::receive`] fail immediately with [`LinkError::Disabled`],
//!   and a suspended `send` or `receive` returns the instant the gate
//!   disables.
//! - [INV-LK002] Nothing crosses an isolation period: on the first use after
//!   the gate re-enables, buffered inbound frames and unsent outbound bytes
//!   are discarded and the outstanding freshness token is revoked.

use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use rbgate_core::link::{FrameValidator, LinkFrame, LinkMessage, LinkStats};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Length prefix width on the transport, in bytes.
const LENGTH_FIELD_LEN: usize = 2;

/// Largest length the transport will buffer. Frames above
/// [`rbgate_core::link::MAX_FRAME_LEN`] still reach the validator and are dropped there as
/// malformed, so an oversized frame cannot tear down the transport.
const TRANSPORT_MAX_LEN: usize = u16::MAX as usize;

/// Errors from the link channel.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The isolators are disabled.
    #[error("link is disabled")]
    Disabled,

    /// The peer closed the transport.
    #[error("link transport closed")]
    Closed,

    /// Transport read failure.
    #[error("link transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport write failure.
    #[error("failed to write frame: {0}")]
    Encode(#[source] std::io::Error),
}

/// Gate state published by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateState {
    /// Whether the isolators currently pass traffic.
    pub enabled: bool,
    /// Incremented on every disabled-to-enabled edge.
    pub epoch: u64,
}

/// Enable/disable control for the link, shared between the sequencer and
/// the link endpoint.
#[derive(Debug, Clone)]
pub struct LinkGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for LinkGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkGate {
    /// Creates a disabled gate. Isolators are disabled at power-up.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Opens the gate.
    pub fn enable(&self) {
        self.tx.send_if_modified(|state| {
            if state.enabled {
                return false;
            }
            state.enabled = true;
            state.epoch = state.epoch.saturating_add(1);
            true
        });
    }

    /// Closes the gate.
    pub fn disable(&self) {
        self.tx.send_if_modified(|state| {
            if !state.enabled {
                return false;
            }
            state.enabled = false;
            true
        });
    }

    /// Returns `true` while the gate is open.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tx.borrow().enabled
    }

    /// Current gate state.
    #[must_use]
    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<GateState> {
        self.tx.subscribe()
    }
}

/// Length-delimited frame transport over a byte stream.
pub type FrameTransport<T> = Framed<T, LengthDelimitedCodec>;

/// Wraps `io` in the link's length-delimited codec.
pub fn frame_transport<T>(io: T) -> FrameTransport<T>
where
    T: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_LEN)
        .max_frame_length(TRANSPORT_MAX_LEN)
        .new_framed(io)
}

/// Trusted-side endpoint of the red-black link.
pub struct RedBlackLink<T> {
    transport: FrameTransport<T>,
    validator: FrameValidator,
    gate: watch::Receiver<GateState>,
    seen_epoch: u64,
    discarded: u64,
}

impl<T> RedBlackLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates an endpoint on `io`, gated by `gate`.
    pub fn new(io: T, gate: &LinkGate) -> Self {
        let gate = gate.subscribe();
        let seen_epoch = gate.borrow().epoch;
        Self {
            transport: frame_transport(io),
            validator: FrameValidator::new(),
            gate,
            seen_epoch,
            discarded: 0,
        }
    }

    /// Returns `true` while the gate is open.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.gate.borrow().enabled
    }

    /// Frame counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.validator.stats()
    }

    /// Inbound frames discarded because they arrived across an isolation
    /// period.
    #[must_use]
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Sends `message`, issuing a fresh token with it.
    ///
    /// A write held up by a peer that is not reading is abandoned when the
    /// gate disables; the unsent bytes are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disabled`] if the gate is closed or closes while
    /// writing, or [`LinkError::Encode`] if the transport write fails.
    pub async fn send(&mut self, message: LinkMessage) -> Result<LinkFrame, LinkError> {
        self.ensure_enabled()?;
        let frame = self.validator.issue(message);

        let disabled = {
            let write = self.transport.send(frame.encode());
            tokio::pin!(write);
            loop {
                tokio::select! {
                    biased;
                    changed = self.gate.changed() => {
                        if changed.is_err() || !self.gate.borrow_and_update().enabled {
                            break true;
                        }
                    },
                    written = &mut write => {
                        written.map_err(LinkError::Encode)?;
                        break false;
                    },
                }
            }
        };
        if !disabled {
            debug!(sequence = frame.sequence, kind = %message.kind(), "link frame sent");
            return Ok(frame);
        }

        self.transport.write_buffer_mut().clear();
        warn!(sequence = frame.sequence, kind = %message.kind(), "link disabled mid-write; frame dropped");
        Err(LinkError::Disabled)
    }

    /// Waits for the next valid inbound frame.
    ///
    /// Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disabled`] if the gate is closed or closes while
    /// waiting, [`LinkError::Closed`] if the peer hangs up, or
    /// [`LinkError::Io`] on a transport failure.
    pub async fn receive(&mut self) -> Result<LinkFrame, LinkError> {
        loop {
            self.ensure_enabled()?;
            let bytes: Bytes = tokio::select! {
                biased;
                changed = self.gate.changed() => {
                    if changed.is_err() {
                        return Err(LinkError::Disabled);
                    }
                    continue;
                },
                item = self.transport.next() => match item {
                    None => return Err(LinkError::Closed),
                    Some(Err(e)) => return Err(LinkError::Io(e)),
                    Some(Ok(bytes)) => bytes.freeze(),
                },
            };

            match self.validator.accept(&bytes) {
                Ok(frame) => {
                    debug!(sequence = frame.sequence, kind = %frame.message.kind(), "link frame accepted");
                    return Ok(frame);
                },
                Err(fault) => {
                    warn!(code = fault.error_code(), error = %fault, "link frame dropped");
                },
            }
        }
    }

    /// Fails if the gate is closed, and resets link state on the first use
    /// after a re-enable.
    fn ensure_enabled(&mut self) -> Result<(), LinkError> {
        let state = *self.gate.borrow_and_update();
        if !state.enabled {
            return Err(LinkError::Disabled);
        }
        if state.epoch != self.seen_epoch {
            self.seen_epoch = state.epoch;
            self.validator.revoke_token();
            self.transport.write_buffer_mut().clear();
            self.drain();
        }
        Ok(())
    }

    fn drain(&mut self) {
        let mut drained = 0u64;
        while let Some(Some(Ok(_))) = self.transport.next().now_or_never() {
            drained = drained.saturating_add(1);
        }
        if drained > 0 {
            self.discarded = self.discarded.saturating_add(drained);
            debug!(drained, "discarded frames buffered across isolation");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rbgate_core::link::FreshnessToken;

    use super::*;

    type Peer = FrameTransport<tokio::io::DuplexStream>;

    fn pair() -> (LinkGate, RedBlackLink<tokio::io::DuplexStream>, Peer) {
        let (a, b) = tokio::io::duplex(1024);
        let gate = LinkGate::new();
        let link = RedBlackLink::new(a, &gate);
        (gate, link, frame_transport(b))
    }

    async fn peer_send(peer: &mut Peer, sequence: u64, token: FreshnessToken, message: LinkMessage) {
        let frame = LinkFrame {
            sequence,
            token,
            message,
        };
        peer.send(frame.encode()).await.unwrap();
    }

    async fn peer_recv(peer: &mut Peer) -> LinkFrame {
        let bytes = peer.next().await.unwrap().unwrap();
        LinkFrame::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_link_fails_immediately() {
        let (_gate, mut link, _peer) = pair();
        assert!(matches!(
            link.send(LinkMessage::Heartbeat).await,
            Err(LinkError::Disabled)
        ));
        assert!(matches!(link.receive().await, Err(LinkError::Disabled)));
    }

    #[tokio::test]
    async fn test_echoed_token_accepted() {
        let (gate, mut link, mut peer) = pair();
        gate.enable();

        link.send(LinkMessage::Heartbeat).await.unwrap();
        let issued = peer_recv(&mut peer).await;
        peer_send(&mut peer, 1, issued.token, LinkMessage::IsolationRequest).await;

        let frame = link.receive().await.unwrap();
        assert_eq!(frame.message, LinkMessage::IsolationRequest);
        assert_eq!(link.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_invalid_frames_never_surface() {
        let (gate, mut link, mut peer) = pair();
        gate.enable();

        link.send(LinkMessage::Heartbeat).await.unwrap();
        let token = peer_recv(&mut peer).await.token;

        peer_send(&mut peer, 5, token, LinkMessage::Heartbeat).await;
        peer.send(Bytes::from_static(&[0xAB; 4])).await.unwrap();
        peer_send(&mut peer, 6, FreshnessToken::from_bytes([0; 16]), LinkMessage::Heartbeat).await;
        peer_send(&mut peer, 5, token, LinkMessage::IsolationRequest).await;
        peer_send(&mut peer, 7, token, LinkMessage::RejoinRequest).await;

        assert_eq!(link.receive().await.unwrap().sequence, 5);
        let frame = link.receive().await.unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.message, LinkMessage::RejoinRequest);

        let stats = link.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.token_mismatch, 1);
        assert_eq!(stats.stale_sequence, 1);
    }

    #[tokio::test]
    async fn test_disable_cancels_suspended_receive() {
        let (gate, mut link, _peer) = pair();
        gate.enable();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gate.disable();
            })
        };

        let result = tokio::time::timeout(Duration::from_secs(1), link.receive())
            .await
            .unwrap();
        assert!(matches!(result, Err(LinkError::Disabled)));
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_cancels_suspended_send() {
        // The peer never reads and one frame is larger than the pipe.
        let (a, _b) = tokio::io::duplex(16);
        let gate = LinkGate::new();
        let mut link = RedBlackLink::new(a, &gate);
        gate.enable();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                gate.disable();
            })
        };

        let result = tokio::time::timeout(Duration::from_millis(500), link.send(LinkMessage::Heartbeat))
            .await
            .expect("send still suspended after the gate disabled");
        assert!(matches!(result, Err(LinkError::Disabled)));
        assert!(!link.is_enabled());
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_across_isolation_discarded() {
        let (gate, mut link, mut peer) = pair();
        gate.enable();
        link.send(LinkMessage::Heartbeat).await.unwrap();
        let token = peer_recv(&mut peer).await.token;

        gate.disable();
        peer_send(&mut peer, 1, token, LinkMessage::IsolationRequest).await;
        tokio::task::yield_now().await;
        gate.enable();

        // First use after re-enable drains the buffer and revokes the token.
        link.send(LinkMessage::RejoinAck).await.unwrap();
        let fresh = peer_recv(&mut peer).await;
        assert_ne!(fresh.token.as_bytes(), token.as_bytes());
        assert_eq!(link.discarded(), 1);

        peer_send(&mut peer, 2, token, LinkMessage::Heartbeat).await;
        peer_send(&mut peer, 3, fresh.token, LinkMessage::Heartbeat).await;
        let frame = link.receive().await.unwrap();
        assert_eq!(frame.sequence, 3);
        assert_eq!(link.stats().token_mismatch, 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped_not_fatal() {
        let (gate, mut link, mut peer) = pair();
        gate.enable();
        link.send(LinkMessage::Heartbeat).await.unwrap();
        let token = peer_recv(&mut peer).await.token;

        peer.send(Bytes::from(vec![0u8; 200])).await.unwrap();
        peer_send(&mut peer, 1, token, LinkMessage::Heartbeat).await;

        assert_eq!(link.receive().await.unwrap().sequence, 1);
        assert_eq!(link.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_peer_hangup_is_closed() {
        let (gate, mut link, peer) = pair();
        gate.enable();
        drop(peer);
        assert!(matches!(link.receive().await, Err(LinkError::Closed)));
    }

    #[test]
    fn test_gate_epoch_counts_enables() {
        let gate = LinkGate::new();
        assert_eq!(gate.state(), GateState::default());
        gate.enable();
        gate.enable();
        gate.disable();
        gate.enable();
        assert_eq!(
            gate.state(),
            GateState {
                enabled: true,
                epoch: 2
            }
        );
    }
}
