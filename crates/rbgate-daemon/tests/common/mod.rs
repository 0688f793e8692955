//! Shared harness for controller integration tests.
//!
//! Runs an [`IsolationController`] on a spawned task against a
//! [`RecordingBoard`] and an in-memory duplex link, with an
//! [`UntrustedPeer`] driving the other end.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rbgate_core::config::{PolicyConfig, SequencerConfig};
use rbgate_core::isolation::IsolationState;
use rbgate_core::link::{FreshnessToken, LinkFrame, LinkMessage};
use rbgate_core::policy::PowerStatus;
use rbgate_core::switch::{IsolatorState, SwitchPosition, SwitchSet};
use rbgate_daemon::board::{Line, SimulatedBoard};
use rbgate_daemon::link::{FrameTransport, frame_transport};
use rbgate_daemon::{
    ControlLines, ControllerError, ControllerReport, IsolationController, LinkGate, PolicyHandle,
    PowerMonitor, PowerSequencer, RedBlackLink, TamperInput, TrustedSignal, tamper_channel,
};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(2);

/// In-memory link buffer per direction.
pub const LINK_BUFFER: usize = 4096;

/// A drive command observed on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Charge(SwitchPosition),
    Ground(SwitchPosition),
    Isolators(IsolatorState),
}

/// Simulated board that records every drive command in order.
#[derive(Debug, Default)]
pub struct RecordingBoard {
    inner: SimulatedBoard,
    log: Mutex<Vec<Command>>,
}

impl RecordingBoard {
    pub fn with_power(status: PowerStatus) -> Self {
        Self {
            inner: SimulatedBoard::with_power(status),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.log.lock().unwrap().clone()
    }

    pub fn command_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn jam(&self, line: Line) {
        self.inner.jam(line);
    }

    pub fn unjam(&self, line: Line) {
        self.inner.unjam(line);
    }

    fn record(&self, command: Command) {
        self.log.lock().unwrap().push(command);
    }
}

impl ControlLines for RecordingBoard {
    fn drive_charge(&self, position: SwitchPosition) {
        self.record(Command::Charge(position));
        self.inner.drive_charge(position);
    }

    fn drive_ground(&self, position: SwitchPosition) {
        self.record(Command::Ground(position));
        self.inner.drive_ground(position);
    }

    fn drive_isolators(&self, state: IsolatorState) {
        self.record(Command::Isolators(state));
        self.inner.drive_isolators(state);
    }

    fn readback(&self) -> SwitchSet {
        self.inner.readback()
    }

    fn rails_nominal(&self) -> bool {
        self.inner.rails_nominal()
    }
}

impl PowerMonitor for RecordingBoard {
    fn power_status(&self) -> PowerStatus {
        self.inner.power_status()
    }
}

/// Untrusted-domain end of the link.
pub struct UntrustedPeer {
    transport: FrameTransport<DuplexStream>,
    next_sequence: u64,
    token: Option<FreshnessToken>,
}

impl UntrustedPeer {
    /// Receives the next frame and adopts its token.
    pub async fn recv(&mut self) -> LinkFrame {
        let bytes = tokio::time::timeout(WAIT, self.transport.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("link closed")
            .expect("transport error");
        let frame = LinkFrame::decode(&bytes).expect("controller sent a malformed frame");
        self.token = Some(frame.token);
        frame
    }

    /// Asserts nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(Ok(bytes))) = tokio::time::timeout(window, self.transport.next()).await {
            panic!("unexpected frame: {:?}", LinkFrame::decode(&bytes));
        }
    }

    /// Sends `message` with the next sequence number and the echoed token.
    pub async fn send(&mut self, message: LinkMessage) {
        self.next_sequence += 1;
        let token = self.token.expect("no token received yet");
        self.send_raw(self.next_sequence, token, message).await;
    }

    /// Sends an arbitrary frame.
    pub async fn send_raw(&mut self, sequence: u64, token: FreshnessToken, message: LinkMessage) {
        self.next_sequence = self.next_sequence.max(sequence);
        let frame = LinkFrame {
            sequence,
            token,
            message,
        };
        self.transport.send(frame.encode()).await.unwrap();
    }

    /// The most recently received token.
    pub fn token(&self) -> FreshnessToken {
        self.token.expect("no token received yet")
    }
}

/// Running controller plus handles to everything around it.
pub struct Harness {
    pub board: Arc<RecordingBoard>,
    pub gate: LinkGate,
    pub sequencer: PowerSequencer<RecordingBoard>,
    pub peer: UntrustedPeer,
    pub signals: mpsc::Sender<TrustedSignal>,
    pub tamper: TamperInput,
    pub policy: PolicyHandle,
    task: JoinHandle<Result<ControllerReport, ControllerError>>,
}

pub fn test_sequencer_config() -> SequencerConfig {
    SequencerConfig {
        step_timeout_ms: 100,
        poll_interval_ms: 1,
        settle_interval_ms: 5,
        rails_timeout_ms: 100,
    }
}

pub const FULL_BATTERY: PowerStatus = PowerStatus {
    battery_percent: 90,
    charging: false,
};

impl Harness {
    pub fn start(power: PowerStatus, sequencer_config: SequencerConfig) -> Self {
        Self::start_with_link_buffer(power, sequencer_config, LINK_BUFFER)
    }

    pub fn start_with_link_buffer(
        power: PowerStatus,
        sequencer_config: SequencerConfig,
        link_buffer: usize,
    ) -> Self {
        let (ours, theirs) = tokio::io::duplex(link_buffer);
        let board = Arc::new(RecordingBoard::with_power(power));
        let gate = LinkGate::new();
        let sequencer = PowerSequencer::new(Arc::clone(&board), sequencer_config, gate.clone());
        let link = RedBlackLink::new(ours, &gate);
        let (tamper, monitor) = tamper_channel();
        let (signals, signal_rx) = mpsc::channel(8);

        let controller = IsolationController::new(
            sequencer.clone(),
            link,
            monitor,
            Arc::clone(&board),
            PolicyConfig::default(),
            signal_rx,
        );
        let policy = controller.policy_handle();
        let task = tokio::spawn(controller.run());

        Self {
            board,
            gate,
            sequencer,
            peer: UntrustedPeer {
                transport: frame_transport(theirs),
                next_sequence: 0,
                token: None,
            },
            signals,
            tamper,
            policy,
            task,
        }
    }

    /// Starts a harness and brings the link up to `Connected`.
    pub async fn connected(power: PowerStatus) -> Self {
        Self::connected_with(power, test_sequencer_config()).await
    }

    pub async fn connected_with(power: PowerStatus, sequencer_config: SequencerConfig) -> Self {
        let mut h = Self::start(power, sequencer_config);
        h.bring_up().await;
        h
    }

    /// Signals `LinkEstablished` and waits for the first heartbeat.
    pub async fn bring_up(&mut self) {
        self.signal(TrustedSignal::LinkEstablished).await;
        let hello = self.peer.recv().await;
        assert_eq!(hello.message, LinkMessage::Heartbeat);
        self.wait_for_state(IsolationState::Connected).await;
    }

    pub async fn signal(&self, signal: TrustedSignal) {
        self.signals.send(signal).await.unwrap();
    }

    pub async fn wait_for_state(&mut self, expected: IsolationState) {
        let result = tokio::time::timeout(WAIT, self.policy.wait_for(|s| *s == expected)).await;
        let reached = result.unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {expected}; state is {}",
                self.policy.current_state()
            )
        });
        assert_eq!(reached, Some(expected));
    }

    pub async fn wait_until_idle(&self) {
        tokio::time::timeout(WAIT, async {
            while self.sequencer.is_busy() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("sequencer never went idle");
    }

    /// Requests isolation and waits until `Isolated`.
    pub async fn isolate(&mut self) {
        self.peer.send(LinkMessage::IsolationRequest).await;
        assert_eq!(self.peer.recv().await.message, LinkMessage::IsolationAck);
        self.wait_for_state(IsolationState::Isolated).await;
    }

    /// Stops the controller and returns its report.
    pub async fn shutdown(self) -> ControllerReport {
        self.signals.send(TrustedSignal::Shutdown).await.unwrap();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked")
            .expect("controller failed")
    }
}

/// Index of the first occurrence of `command` in `log`.
pub fn position(log: &[Command], command: Command) -> usize {
    log.iter()
        .position(|c| *c == command)
        .unwrap_or_else(|| panic!("{command:?} not in {log:?}"))
}
