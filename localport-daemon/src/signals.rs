//! Signal-to-loop bridge
//!
//! Signals are consumed by one dedicated task that forwards typed events
//! over a channel to the daemon loop. Nothing else ever happens in signal
//! context; the handler's only job is the thread-safe wakeup. A second
//! terminate during shutdown escalates instead of starting a new one.

use tokio::sync::mpsc;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Events delivered to the daemon loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// First SIGTERM/SIGINT: begin orderly shutdown
    ShutdownRequested,
    /// Repeated terminate signal: jump to forced cleanup
    EmergencyShutdown,
    /// SIGHUP: re-read configuration and reconcile
    ReloadRequested,
}

/// Spawn the bridge task. Returns the join handle; the task ends when the
/// receiving side closes.
#[cfg(unix)]
pub fn spawn_signal_bridge(events: mpsc::Sender<DaemonEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot install SIGINT handler: {}", e);
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot install SIGHUP handler: {}", e);
                return;
            }
        };

        let mut shutdown_seen = false;

        loop {
            let event = tokio::select! {
                _ = sigterm.recv() => terminate_event(&mut shutdown_seen, "SIGTERM"),
                _ = sigint.recv() => terminate_event(&mut shutdown_seen, "SIGINT"),
                _ = sighup.recv() => {
                    info!("SIGHUP received, requesting reload");
                    DaemonEvent::ReloadRequested
                }
            };

            if events.send(event).await.is_err() {
                return; // daemon loop is gone
            }
        }
    })
}

fn terminate_event(shutdown_seen: &mut bool, name: &str) -> DaemonEvent {
    if *shutdown_seen {
        warn!("{} received during shutdown, escalating to emergency cleanup", name);
        DaemonEvent::EmergencyShutdown
    } else {
        info!("{} received, beginning shutdown", name);
        *shutdown_seen = true;
        DaemonEvent::ShutdownRequested
    }
}

#[cfg(not(unix))]
pub fn spawn_signal_bridge(events: mpsc::Sender<DaemonEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(DaemonEvent::ShutdownRequested).await;
        }
    })
}
