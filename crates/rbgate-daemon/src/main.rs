//! rbgate-daemon - red/black isolation controller
//!
//! Runs the isolation controller against the simulated board and serves the
//! red-black link on a Unix socket. One untrusted-domain connection is
//! accepted; the link is brought up as soon as it connects.
//!
//! # Signals
//!
//! - `SIGUSR1`: isolated crypto work complete, rejoin
//! - `SIGUSR2`: simulated tamper edge
//! - `SIGTERM` / `SIGINT`: shutdown

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rbgate_core::config::RbgateConfig;
use rbgate_core::policy::PowerStatus;
use rbgate_daemon::board::SimulatedBoard;
use rbgate_daemon::{
    IsolationController, LinkGate, PowerSequencer, RedBlackLink, TamperInput, TrustedSignal,
    tamper_channel,
};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// rbgate daemon - red/black isolation controller
#[derive(Parser, Debug)]
#[command(name = "rbgate-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the link socket path from the configuration
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Battery percentage reported by the simulated board
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u8).range(0..=100))]
    battery_percent: u8,

    /// Report the simulated charger as active
    #[arg(long)]
    charging: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => RbgateConfig::from_file(path).context("failed to load configuration")?,
        None => RbgateConfig::default(),
    };
    if let Some(socket) = &args.socket {
        config.link.socket_path.clone_from(socket);
    }

    let socket_path = config.link.socket_path.clone();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("failed to remove stale link socket")?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind link socket {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "waiting for untrusted domain");

    let (stream, _) = tokio::select! {
        accepted = listener.accept() => accepted.context("failed to accept link connection")?,
        () = shutdown_requested() => {
            info!("shutdown before link connection");
            cleanup(&socket_path);
            return Ok(());
        },
    };
    info!("untrusted domain connected");

    let board = Arc::new(SimulatedBoard::with_power(PowerStatus {
        battery_percent: args.battery_percent,
        charging: args.charging,
    }));
    let gate = LinkGate::new();
    let sequencer = PowerSequencer::new(Arc::clone(&board), config.sequencer, gate.clone());
    let link = RedBlackLink::new(stream, &gate);
    let (tamper_input, tamper_monitor) = tamper_channel();
    let (signal_tx, signal_rx) = mpsc::channel(16);

    let controller = IsolationController::new(
        sequencer,
        link,
        tamper_monitor,
        board,
        config.policy,
        signal_rx,
    );

    signal_tx
        .send(TrustedSignal::LinkEstablished)
        .await
        .context("controller signal channel closed")?;

    let signal_task = tokio::spawn(forward_signals(signal_tx, tamper_input));

    let result = controller.run().await;
    signal_task.abort();
    cleanup(&socket_path);

    match result {
        Ok(report) => {
            info!(
                final_state = %report.final_state,
                accepted = report.link_stats.accepted,
                dropped = report.link_stats.dropped(),
                protocol_faults = report.protocol_faults,
                "controller exited"
            );
            Ok(())
        },
        Err(e) => {
            error!(error = %e, "controller failed");
            Err(e).context("isolation controller failed")
        },
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Maps process signals onto controller inputs until shutdown.
async fn forward_signals(tx: mpsc::Sender<TrustedSignal>, tamper: TamperInput) -> Result<()> {
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("failed to register SIGUSR1")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).context("failed to register SIGUSR2")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    loop {
        let signal = tokio::select! {
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1");
                TrustedSignal::CryptoOperationComplete
            },
            _ = sigusr2.recv() => {
                warn!("Received SIGUSR2; asserting simulated tamper edge");
                tamper.assert_edge();
                continue;
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                TrustedSignal::Shutdown
            },
            _ = sigint.recv() => {
                info!("Received SIGINT");
                TrustedSignal::Shutdown
            },
        };

        let shutdown = signal == TrustedSignal::Shutdown;
        if tx.send(signal).await.is_err() || shutdown {
            return Ok(());
        }
    }
}

async fn shutdown_requested() {
    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return std::future::pending().await;
    };
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

fn cleanup(socket_path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(socket_path) {
        warn!(error = %e, "failed to remove link socket");
    }
}
