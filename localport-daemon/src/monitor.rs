//! Health monitor scheduler
//!
//! One cooperative task per monitored service: interruptible interval
//! sleep, PID liveness check, probe with deadline, counter updates, and a
//! notification to the supervisor on threshold crossings. The task holds
//! only the service id and read access to shared state; lifecycle
//! transitions stay with the supervisor.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::process_alive;
use crate::health::{compose, run_probe, ProbeOutcome};
use crate::identity::ServiceId;
use crate::state::{HealthVerdict, ServiceStatus, SharedDaemonState};
use crate::supervisor::SupervisorEvent;
use crate::tasks::ActivityTracker;

/// Spawn the monitor loop for one service
pub fn spawn_health_monitor(
    id: ServiceId,
    state: SharedDaemonState,
    events: mpsc::Sender<SupervisorEvent>,
    activity: Arc<ActivityTracker>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        monitor_loop(id, state, events, activity, token).await;
    })
}

async fn monitor_loop(
    id: ServiceId,
    state: SharedDaemonState,
    events: mpsc::Sender<SupervisorEvent>,
    activity: Arc<ActivityTracker>,
    token: CancellationToken,
) {
    debug!("Health monitor for {} started", id);

    loop {
        // Interval is re-read every cycle so a reload that only tunes the
        // probe takes effect without restarting anything
        let Some(interval) = current_interval(&state, &id) else {
            break;
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        // Snapshot after the sleep; the world may have changed under us
        let Some(snapshot) = probe_snapshot(&state, &id) else {
            break;
        };

        let ProbeContext {
            definition,
            epoch,
            pid,
            status,
        } = snapshot;

        match status {
            ServiceStatus::Restarting => continue, // between epochs, nothing to probe
            status if !status.is_live() => break,
            _ => {}
        }

        // A vanished PID is a fact, not a probe sample: report and let the
        // supervisor route it through the child-exit path
        if let Some(pid) = pid {
            if !process_alive(pid) {
                warn!("Service {} child pid {} is gone", definition.name, pid);
                let _ = events
                    .send(SupervisorEvent::ChildGone { id, epoch })
                    .await;
                continue;
            }
        }

        let outcome = {
            let _guard = activity.begin();
            run_probe(&definition, &token).await
        };
        let healthy = match outcome {
            ProbeOutcome::Cancelled => break,
            ProbeOutcome::Healthy => {
                // Cluster verdict can override a locally-green probe
                let cluster_unhealthy = state.read().cluster_unhealthy_for(&definition);
                compose(HealthVerdict::Healthy, cluster_unhealthy) == HealthVerdict::Healthy
            }
            ProbeOutcome::Unhealthy(_) => false,
        };
        let detail = match &outcome {
            ProbeOutcome::Unhealthy(reason) => Some(reason.clone()),
            _ => None,
        };

        // Update counters under the lock; notify outside it
        let crossing = record_outcome(&state, &id, epoch, healthy, detail.clone());

        match crossing {
            Some(Crossing::BecameUnhealthy) => {
                info!(
                    "Service {} crossed failure threshold ({})",
                    definition.name,
                    detail.as_deref().unwrap_or("probe failed")
                );
                let _ = events
                    .send(SupervisorEvent::HealthChanged {
                        id,
                        epoch,
                        healthy: false,
                        detail,
                    })
                    .await;
            }
            Some(Crossing::BecameHealthy) => {
                info!("Service {} is healthy", definition.name);
                let _ = events
                    .send(SupervisorEvent::HealthChanged {
                        id,
                        epoch,
                        healthy: true,
                        detail: None,
                    })
                    .await;
            }
            None => {}
        }
    }

    debug!("Health monitor for {} exiting", id);
}

struct ProbeContext {
    definition: crate::config::ResolvedService,
    epoch: chrono::DateTime<chrono::Utc>,
    pid: Option<u32>,
    status: ServiceStatus,
}

fn current_interval(state: &SharedDaemonState, id: &ServiceId) -> Option<std::time::Duration> {
    let state = state.read();
    let definition = state.definitions.get(id)?;
    state.services.get(id)?;
    Some(definition.health_check.interval)
}

fn probe_snapshot(state: &SharedDaemonState, id: &ServiceId) -> Option<ProbeContext> {
    let state = state.read();
    let definition = state.definitions.get(id)?.clone();
    let record = state.services.get(id)?;
    Some(ProbeContext {
        definition,
        epoch: record.epoch?,
        pid: record.pid,
        status: record.status,
    })
}

enum Crossing {
    BecameHealthy,
    BecameUnhealthy,
}

/// Apply one probe result to the service's counters, returning a crossing
/// when a threshold was just reached. Stale results (epoch moved on) and
/// results for non-live states are dropped.
fn record_outcome(
    state: &SharedDaemonState,
    id: &ServiceId,
    epoch: chrono::DateTime<chrono::Utc>,
    healthy: bool,
    detail: Option<String>,
) -> Option<Crossing> {
    let mut state = state.write();
    let state = &mut *state;
    let definition = state.definitions.get(id)?;
    let record = state.services.get_mut(id)?;

    if record.epoch != Some(epoch) || !record.status.is_live() {
        debug!("Dropping stale probe result for {}", id);
        return None;
    }

    record.health.last_checked = Some(chrono::Utc::now());
    record.health.detail = detail;

    let spec = &definition.health_check;

    if healthy {
        record.consecutive_successes += 1;
        record.consecutive_failures = 0;
        if record.health.verdict != HealthVerdict::Healthy
            && record.consecutive_successes >= spec.success_threshold
        {
            record.health.verdict = HealthVerdict::Healthy;
            return Some(Crossing::BecameHealthy);
        }
    } else {
        record.consecutive_failures += 1;
        record.consecutive_successes = 0;
        if record.health.verdict != HealthVerdict::Unhealthy
            && record.consecutive_failures >= spec.failure_threshold
        {
            record.health.verdict = HealthVerdict::Unhealthy;
            return Some(Crossing::BecameUnhealthy);
        }
    }

    None
}
