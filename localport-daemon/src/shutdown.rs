//! Four-phase shutdown coordinator
//!
//! Quiesce: refuse new starts, stop accepting control connections.
//! Drain: let in-flight probes and reconciliation finish naturally.
//! Cancel: cancel cooperative tasks in descending priority order, then
//! gracefully stop every child.
//! Force: SIGKILL survivors, write the final persisted snapshot.
//!
//! Each phase has its own deadline; the coordinator never outlives their
//! sum. A second terminate signal, or two phase overruns, jumps straight
//! to Force.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::signals::DaemonEvent;
use crate::supervisor::Supervisor;
use crate::tasks::TaskRegistry;

/// Per-phase deadlines. Defaults sum to 30s.
#[derive(Debug, Clone)]
pub struct PhaseBudgets {
    pub quiesce: Duration,
    pub drain: Duration,
    pub cancel: Duration,
    pub force: Duration,
}

impl Default for PhaseBudgets {
    fn default() -> Self {
        Self {
            quiesce: Duration::from_secs(2),
            drain: Duration::from_secs(8),
            cancel: Duration::from_secs(15),
            force: Duration::from_secs(5),
        }
    }
}

/// How shutdown ended; maps to the daemon's exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All phases completed within their deadlines
    Clean,
    /// Emergency path taken (repeat signal or repeated phase overrun)
    Escalated,
}

pub struct ShutdownCoordinator {
    supervisor: Arc<Supervisor>,
    registry: Arc<TaskRegistry>,
    server_shutdown: mpsc::Sender<()>,
    budgets: PhaseBudgets,
}

impl ShutdownCoordinator {
    pub fn new(
        supervisor: Arc<Supervisor>,
        registry: Arc<TaskRegistry>,
        server_shutdown: mpsc::Sender<()>,
        budgets: PhaseBudgets,
    ) -> Self {
        Self {
            supervisor,
            registry,
            server_shutdown,
            budgets,
        }
    }

    /// Run the full shutdown. `events` keeps delivering signal-bridge
    /// events so a repeat terminate can escalate mid-flight.
    pub async fn run(self, events: &mut mpsc::Receiver<DaemonEvent>) -> ShutdownOutcome {
        let mut overruns: u32 = 0;

        // Phase 1: Quiesce
        info!("Shutdown phase 1/4: quiesce");
        self.supervisor.set_draining();
        let _ = self.server_shutdown.try_send(());

        // Phase 2: Drain
        info!("Shutdown phase 2/4: drain in-flight work");
        match self
            .interruptible(events, self.registry.activity().drain(self.budgets.drain))
            .await
        {
            PhaseResult::Emergency => return self.force_phase().await,
            PhaseResult::Done(true) => {}
            PhaseResult::Done(false) => {
                warn!("Drain phase deadline exceeded");
                overruns += 1;
            }
        }

        // Phase 3: Cancel tasks, stop children
        info!("Shutdown phase 3/4: cancel tasks and stop children");
        let cancel = async {
            let leaked = self.registry.cancel_all(self.budgets.cancel / 2).await;
            for name in &leaked {
                warn!("Cooperative task {} leaked past cancellation", name);
            }
            self.supervisor.stop_all_children().await;
        };
        match self
            .interruptible(events, tokio::time::timeout(self.budgets.cancel, cancel))
            .await
        {
            PhaseResult::Emergency => return self.force_phase().await,
            PhaseResult::Done(Ok(())) => {}
            PhaseResult::Done(Err(_)) => {
                warn!("Cancel phase deadline exceeded");
                overruns += 1;
            }
        }

        if overruns >= 2 {
            warn!("Two phase deadlines exceeded, escalating");
            return self.force_phase().await;
        }

        // Phase 4 runs unconditionally: it is the cleanup of record
        self.force_phase().await
    }

    /// Phase 4: force-kill survivors, final snapshot, verify.
    /// Escalated when anything was still alive entering this phase; a
    /// clean run has no children left for SIGKILL to find.
    async fn force_phase(&self) -> ShutdownOutcome {
        info!("Shutdown phase 4/4: force cleanup");

        let survivors_before = self.supervisor.live_children();
        let escalated = !survivors_before.is_empty();
        if escalated {
            warn!(
                "{} children still alive entering force phase",
                survivors_before.len()
            );
        }

        let force = async {
            self.supervisor.force_cleanup();
            // Give SIGKILL a beat, then verify
            tokio::time::sleep(Duration::from_millis(200)).await;
            let survivors = survivors_before
                .iter()
                .filter(|pid| crate::adapters::process_alive(**pid))
                .count();
            if survivors > 0 {
                warn!("{} children survived SIGKILL", survivors);
            }
        };

        if tokio::time::timeout(self.budgets.force, force).await.is_err() {
            warn!("Force phase deadline exceeded");
        }

        if escalated {
            ShutdownOutcome::Escalated
        } else {
            ShutdownOutcome::Clean
        }
    }

    /// Run a phase future, letting an emergency signal pre-empt it
    async fn interruptible<F: std::future::Future>(
        &self,
        events: &mut mpsc::Receiver<DaemonEvent>,
        phase: F,
    ) -> PhaseResult<F::Output> {
        tokio::pin!(phase);
        loop {
            tokio::select! {
                output = &mut phase => return PhaseResult::Done(output),
                event = events.recv() => match event {
                    Some(DaemonEvent::EmergencyShutdown) => return PhaseResult::Emergency,
                    Some(_) | None => continue, // reloads etc. are moot now
                },
            }
        }
    }
}

enum PhaseResult<T> {
    Done(T),
    Emergency,
}

#[cfg(test)]
mod tests;
