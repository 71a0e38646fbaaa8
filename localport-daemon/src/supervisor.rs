//! The supervisor: central control plane for every forward
//!
//! Owns the live service table (single writer), spawns and terminates
//! forwarder children through the adapters, registers health monitors,
//! applies restart policy on degradation, reconciles the running set
//! against configuration, and keeps the persisted snapshot current.

use chrono::{DateTime, Utc};
use localport_protocol::protocol::{ServiceOpResult, ServiceSelector, StatusSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{
    self, process_alive, process_start_time, spawn_forward, ForwardCommand, ForwardExit, StopTx,
};
use crate::config::{LocalportConfig, ResolvedService};
use crate::errors::{DaemonError, Result};
use crate::identity::ServiceId;
use crate::monitor::spawn_health_monitor;
use crate::persistence::{PersistedForward, StateStore};
use crate::ports;
use crate::restart::{RestartDecision, RestartTracker};
use crate::service_log::ServiceLog;
use crate::state::{
    HealthVerdict, OrphanEntry, RunningService, ServiceStatus, SharedDaemonState,
};
use crate::tasks::{TaskRegistry, PRIORITY_CLUSTER, PRIORITY_HEALTH};

/// Events feeding the supervisor's single-writer loop
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Threshold crossing reported by a health monitor
    HealthChanged {
        id: ServiceId,
        epoch: DateTime<Utc>,
        healthy: bool,
        detail: Option<String>,
    },
    /// Monitor saw the child PID vanish (adopted forwards have no waiter)
    ChildGone { id: ServiceId, epoch: DateTime<Utc> },
    /// Natural exit reported by the child's waiter task
    ChildExited(ForwardExit),
    /// A scheduled restart delay elapsed
    RestartDue { id: ServiceId, attempt: u32 },
}

/// Handle for terminating a running child
enum ForwardHandle {
    /// We spawned it: the waiter task owns the Child and stops it on request
    Spawned { stop_tx: StopTx },
    /// Adopted from persisted state after a daemon restart: PID only
    Adopted { pid: u32 },
}

/// Builds the forwarder invocation for a definition. The default is
/// [`adapters::command_for`]; tests substitute stub commands.
type CommandBuilder = Arc<dyn Fn(&ResolvedService) -> Result<ForwardCommand> + Send + Sync>;

pub struct Supervisor {
    state: SharedDaemonState,
    store: StateStore,
    registry: Arc<TaskRegistry>,
    logs_dir: PathBuf,
    restarts: Mutex<RestartTracker>,
    handles: Mutex<HashMap<ServiceId, ForwardHandle>>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    exit_tx: mpsc::Sender<ForwardExit>,
    command_builder: CommandBuilder,
}

impl Supervisor {
    /// Build the supervisor and its event channel. The returned receiver
    /// must be driven by [`Supervisor::run_events`].
    pub fn new(
        state: SharedDaemonState,
        store: StateStore,
        registry: Arc<TaskRegistry>,
        logs_dir: PathBuf,
    ) -> (Arc<Self>, mpsc::Receiver<SupervisorEvent>) {
        Self::with_builder(state, store, registry, logs_dir, Arc::new(adapters::command_for))
    }

    #[cfg(test)]
    pub(crate) fn new_with_builder(
        state: SharedDaemonState,
        store: StateStore,
        registry: Arc<TaskRegistry>,
        logs_dir: PathBuf,
        command_builder: CommandBuilder,
    ) -> (Arc<Self>, mpsc::Receiver<SupervisorEvent>) {
        Self::with_builder(state, store, registry, logs_dir, command_builder)
    }

    fn with_builder(
        state: SharedDaemonState,
        store: StateStore,
        registry: Arc<TaskRegistry>,
        logs_dir: PathBuf,
        command_builder: CommandBuilder,
    ) -> (Arc<Self>, mpsc::Receiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (exit_tx, mut exit_rx) = mpsc::channel::<ForwardExit>(256);

        // Child waiters speak ForwardExit; fold them into the event stream
        let forwarder = events_tx.clone();
        tokio::spawn(async move {
            while let Some(exit) = exit_rx.recv().await {
                if forwarder
                    .send(SupervisorEvent::ChildExited(exit))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let supervisor = Arc::new(Self {
            state,
            store,
            registry,
            logs_dir,
            restarts: Mutex::new(RestartTracker::new()),
            handles: Mutex::new(HashMap::new()),
            events_tx,
            exit_tx,
            command_builder,
        });

        (supervisor, events_rx)
    }

    /// Drive the event loop until the channel closes. All lifecycle
    /// mutations funnel through here, which is what makes per-service
    /// transitions totally ordered.
    pub async fn run_events(self: Arc<Self>, mut events_rx: mpsc::Receiver<SupervisorEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                SupervisorEvent::HealthChanged {
                    id,
                    epoch,
                    healthy,
                    detail,
                } => self.on_health_change(id, epoch, healthy, detail).await,
                SupervisorEvent::ChildGone { id, epoch } => {
                    self.on_child_lost(id, epoch, None).await
                }
                SupervisorEvent::ChildExited(exit) => {
                    let detail = Some(match (exit.exit_code, exit.signal) {
                        (Some(code), _) => format!("forwarder exited with code {}", code),
                        (None, Some(signal)) => format!("forwarder killed by signal {}", signal),
                        (None, None) => "forwarder exited".to_string(),
                    });
                    self.on_child_lost(exit.id, exit.epoch, detail).await
                }
                SupervisorEvent::RestartDue { id, attempt } => {
                    self.on_restart_due(id, attempt).await
                }
            }
        }
    }

    // =========================================================================
    // Public operations (control surface)
    // =========================================================================

    /// Start the selected services. One result per resolved service.
    pub async fn start_services(&self, selector: &ServiceSelector) -> Vec<ServiceOpResult> {
        let (targets, unknown) = self.select(selector);
        let mut results: Vec<ServiceOpResult> = unknown
            .into_iter()
            .map(|name| ServiceOpResult::failed(name, "service not found"))
            .collect();
        if targets.is_empty() && results.is_empty() {
            return vec![ServiceOpResult::failed(
                selector_label(selector),
                "no services matched",
            )];
        }

        for definition in targets {
            let name = definition.name.clone();
            match self.start_one(&definition).await {
                Ok(StartOutcome::Started) => results.push(ServiceOpResult::ok(name)),
                Ok(StartOutcome::AlreadyRunning) => {
                    results.push(ServiceOpResult::ok_with(name, "already running"))
                }
                Err(e) => results.push(ServiceOpResult::failed(name, e.to_string())),
            }
        }
        results
    }

    /// Stop the selected services; optionally also clean up orphans.
    pub async fn stop_services(
        &self,
        selector: &ServiceSelector,
        orphans: bool,
    ) -> Vec<ServiceOpResult> {
        let (targets, unknown) = self.select(selector);
        let mut results: Vec<ServiceOpResult> = unknown
            .into_iter()
            .map(|name| ServiceOpResult::failed(name, "service not found"))
            .collect();

        for definition in targets {
            let name = definition.name.clone();
            match self.stop_one(&definition.id).await {
                Ok(true) => results.push(ServiceOpResult::ok(name)),
                Ok(false) => results.push(ServiceOpResult::ok_with(name, "not running")),
                Err(e) => results.push(ServiceOpResult::failed(name, e.to_string())),
            }
        }

        if orphans {
            results.extend(self.cleanup_orphans().await);
        }

        results
    }

    /// One reconciler pass: route dead PIDs through the child-exit path
    /// and drop finished task entries. Runs from the periodic reconciler
    /// task and before every status snapshot, so a record never stays
    /// `running` with no process behind it just because nobody asked.
    pub fn reconcile_tick(&self) {
        self.sweep_dead_pids();
        self.registry.prune_finished();
    }

    /// Snapshot every known service (pure read apart from the dead-PID
    /// sweep, which routes through the event loop)
    pub fn status(&self) -> StatusSnapshot {
        self.reconcile_tick();

        let state = self.state.read();
        let mut services: Vec<_> = state
            .definitions
            .values()
            .map(|definition| match state.services.get(&definition.id) {
                Some(record) => record.to_status_info(definition),
                None => RunningService::new(definition.id)
                    .stopped_placeholder()
                    .to_status_info(definition),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        StatusSnapshot {
            daemon_pid: std::process::id(),
            daemon_started_at: state.started_at.timestamp(),
            services,
            orphans: state.orphans.iter().map(|o| o.to_info()).collect(),
        }
    }

    /// Resolve the service-log path for a service name
    pub fn log_path(&self, service: &str) -> Result<PathBuf> {
        let state = self.state.read();
        let definition = state
            .definition_by_name(service)
            .ok_or_else(|| DaemonError::ServiceNotFound(service.to_string()))?;
        Ok(ServiceLog::new(&self.logs_dir, &definition.name, &definition.id)
            .path()
            .to_path_buf())
    }

    /// Apply a (re)loaded configuration: install definitions, report
    /// per-entry resolution failures, reconcile the live set, sync cluster
    /// pollers.
    pub async fn apply_config(&self, config: &LocalportConfig) -> Vec<ServiceOpResult> {
        let (resolved, failures) = config.resolve_services();
        let mut results: Vec<ServiceOpResult> = failures
            .into_iter()
            .map(|(name, message)| ServiceOpResult::failed(name, message))
            .collect();

        results.extend(self.reconcile(resolved, config).await);
        results
    }

    // =========================================================================
    // Startup reconciliation
    // =========================================================================

    /// Reconcile persisted state against the current configuration on
    /// daemon boot: adopt matching live PIDs, track orphans, discard the
    /// rest. Never signals anything it does not recognize as ours.
    pub fn adopt_persisted(&self, config: &LocalportConfig) {
        let persisted = self.store.load();
        if persisted.forwards.is_empty() {
            return;
        }

        let (resolved, _) = config.resolve_services();
        let definitions: HashMap<ServiceId, &ResolvedService> =
            resolved.iter().map(|d| (d.id, d)).collect();

        let mut state = self.state.write();

        for entry in persisted.forwards {
            if !process_alive(entry.pid) {
                debug!(
                    "Persisted pid {} for {} is gone, discarding entry",
                    entry.pid, entry.name
                );
                continue;
            }

            // PID-reuse guard: the process must have started when we
            // recorded it did
            if let Some(actual_start) = process_start_time(entry.pid) {
                let drift = (entry.started_at.timestamp() - actual_start).abs();
                if drift > 1 {
                    warn!(
                        "Persisted pid {} for {} has start time drift {}s, likely reused; discarding",
                        entry.pid, entry.name, drift
                    );
                    continue;
                }
            }

            match definitions.get(&entry.service_id) {
                Some(definition) => {
                    let expected = match (self.command_builder)(definition).map(|c| c.fingerprint())
                    {
                        Ok(fingerprint) => fingerprint,
                        Err(e) => {
                            warn!("Cannot compute fingerprint for {}: {}", definition.name, e);
                            continue;
                        }
                    };
                    if expected != entry.argv_fingerprint {
                        warn!(
                            "Persisted pid {} for {} no longer matches configured command, discarding",
                            entry.pid, entry.name
                        );
                        continue;
                    }

                    info!(
                        "Adopting running forwarder for {} (pid {})",
                        entry.name, entry.pid
                    );
                    let mut record = RunningService::new(entry.service_id);
                    record.status = ServiceStatus::Running;
                    record.begin_epoch(entry.pid, entry.started_at);
                    record.argv_fingerprint = Some(entry.argv_fingerprint.clone());
                    record.adopted = true;
                    record.log_path = Some(
                        ServiceLog::new(&self.logs_dir, &definition.name, &definition.id)
                            .path()
                            .to_path_buf(),
                    );
                    state.services.insert(entry.service_id, record);

                    self.handles
                        .lock()
                        .insert(entry.service_id, ForwardHandle::Adopted { pid: entry.pid });
                }
                None => {
                    info!(
                        "Persisted forwarder for {} (pid {}) is no longer configured; tracking as orphan",
                        entry.name, entry.pid
                    );
                    state.orphans.push(OrphanEntry {
                        id: entry.service_id,
                        name: entry.name,
                        pid: entry.pid,
                        local_port: entry.local_port,
                    });
                }
            }
        }

        drop(state);
        self.persist();
    }

    /// Start the health monitors for every adopted record. Separate from
    /// `adopt_persisted` so the caller controls when probing begins.
    pub fn start_adopted_monitors(self: &Arc<Self>) {
        let adopted: Vec<ServiceId> = {
            let state = self.state.read();
            state
                .services
                .values()
                .filter(|r| r.adopted && r.status.is_live())
                .map(|r| r.id)
                .collect()
        };
        for id in adopted {
            self.register_monitor(id);
        }
    }

    // =========================================================================
    // Internals: start / stop
    // =========================================================================

    async fn start_one(&self, definition: &ResolvedService) -> Result<StartOutcome> {
        // Claim the id under the write lock: a concurrent start sees
        // `starting` and reports already-running instead of double-spawning
        {
            let mut state = self.state.write();
            if state.draining {
                return Err(DaemonError::Internal(
                    "daemon is shutting down, refusing new starts".to_string(),
                ));
            }
            if let Some(record) = state.services.get(&definition.id) {
                if record.status.is_live() {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                if record.status == ServiceStatus::Stopping {
                    return Err(DaemonError::Internal(format!(
                        "service {} is still stopping",
                        definition.name
                    )));
                }
            }
            let record = state
                .services
                .entry(definition.id)
                .or_insert_with(|| RunningService::new(definition.id));
            record.status = ServiceStatus::Starting;
            record.last_error = None;
        }

        if let Err(e) = self.check_port_free(definition).await {
            let mut state = self.state.write();
            if let Some(record) = state.services.get_mut(&definition.id) {
                record.status = ServiceStatus::Failed;
                record.last_error = Some(e.to_string());
            }
            return Err(e);
        }

        match self.spawn_epoch(definition).await {
            Ok(()) => {
                // A deliberate start is a fresh slate for restart policy
                {
                    let mut state = self.state.write();
                    if let Some(record) = state.services.get_mut(&definition.id) {
                        record.restart_attempt = 0;
                    }
                }
                self.restarts.lock().forget(&definition.id);
                self.register_monitor(definition.id);
                self.persist();
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                let mut state = self.state.write();
                if let Some(record) = state.services.get_mut(&definition.id) {
                    record.status = ServiceStatus::Failed;
                    record.pid = None;
                    record.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Spawn a child for the definition and move its record into Running
    async fn spawn_epoch(&self, definition: &ResolvedService) -> Result<()> {
        let command = (self.command_builder)(definition)?;
        let log = ServiceLog::new(&self.logs_dir, &definition.name, &definition.id);
        let spawned = spawn_forward(definition, &command, &log, self.exit_tx.clone())?;

        {
            let mut state = self.state.write();
            let record = state
                .services
                .entry(definition.id)
                .or_insert_with(|| RunningService::new(definition.id));
            record.status = ServiceStatus::Running;
            record.begin_epoch(spawned.pid, spawned.started_at);
            record.argv_fingerprint = Some(spawned.argv_fingerprint.clone());
            record.log_path = Some(log.path().to_path_buf());
            record.adopted = false;
        }

        self.handles.lock().insert(
            definition.id,
            ForwardHandle::Spawned {
                stop_tx: spawned.stop_tx,
            },
        );

        Ok(())
    }

    /// Refuse to start when the local port is held by anything that is not
    /// the service's own recorded child
    async fn check_port_free(&self, definition: &ResolvedService) -> Result<()> {
        let Some(holder) = ports::find_listener(definition.local_port).await else {
            return Ok(());
        };

        let state = self.state.read();
        if let Some(pid) = holder.pid {
            if state
                .services
                .get(&definition.id)
                .and_then(|r| r.pid)
                .map(|own| own == pid)
                .unwrap_or(false)
            {
                // Our own child from a prior epoch still holds it; the
                // is_live check above already handled this, be safe anyway
                return Ok(());
            }
            if let Some(orphan) = state.orphans.iter().find(|o| o.pid == pid) {
                return Err(DaemonError::PortConflict {
                    port: definition.local_port,
                    holder: format!(
                        "orphaned localport forwarder {} (pid {}); run stop --orphans to clean up",
                        orphan.name, orphan.pid
                    ),
                });
            }
        }

        Err(DaemonError::PortConflict {
            port: definition.local_port,
            holder: holder.describe(),
        })
    }

    /// Stop one service. Ok(false) when it was not running (idempotent).
    async fn stop_one(&self, id: &ServiceId) -> Result<bool> {
        let (grace, pid) = {
            let mut state = self.state.write();
            let Some(record) = state.services.get_mut(id) else {
                return Ok(false);
            };
            if record.status.is_terminal() || record.status == ServiceStatus::Stopping {
                return Ok(false);
            }
            record.status = ServiceStatus::Stopping;
            let grace = state
                .definitions
                .get(id)
                .map(|d| d.stop_grace_period)
                .unwrap_or(Duration::from_secs(5));
            (grace, state.services.get(id).and_then(|r| r.pid))
        };

        // The monitor must not see the deliberate stop as a failure
        self.cancel_monitor(id);

        let handle = self.handles.lock().remove(id);
        match handle {
            Some(ForwardHandle::Spawned { stop_tx }) => {
                let _ = stop_tx.send(grace);
            }
            Some(ForwardHandle::Adopted { pid }) => {
                adapters::terminate_pid(pid, grace).await;
            }
            None => {}
        }

        // Confirm the child is actually gone before declaring stopped
        if let Some(pid) = pid {
            let deadline = tokio::time::Instant::now() + grace + Duration::from_secs(2);
            while process_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if process_alive(pid) {
                warn!("Child {} survived stop sequence for {}", pid, id);
            }
        }

        {
            let mut state = self.state.write();
            state.services.remove(id);
        }
        self.restarts.lock().forget(id);
        self.persist();

        info!("Service {} stopped", id);
        Ok(true)
    }

    /// Terminate orphaned forwarders on explicit request
    async fn cleanup_orphans(&self) -> Vec<ServiceOpResult> {
        let orphans: Vec<OrphanEntry> = {
            let state = self.state.read();
            state.orphans.clone()
        };

        let mut results = Vec::new();
        for orphan in orphans {
            let killed = adapters::terminate_pid(orphan.pid, Duration::from_secs(5)).await;
            if killed {
                let mut state = self.state.write();
                state.orphans.retain(|o| o.pid != orphan.pid);
                results.push(ServiceOpResult::ok_with(
                    orphan.name,
                    format!("orphan pid {} cleaned up", orphan.pid),
                ));
            } else {
                results.push(ServiceOpResult::failed(
                    orphan.name,
                    format!("orphan pid {} could not be terminated", orphan.pid),
                ));
            }
        }
        results
    }

    // =========================================================================
    // Internals: reconciliation
    // =========================================================================

    async fn reconcile(
        &self,
        resolved: Vec<ResolvedService>,
        config: &LocalportConfig,
    ) -> Vec<ServiceOpResult> {
        let desired: HashMap<ServiceId, ResolvedService> =
            resolved.into_iter().map(|d| (d.id, d)).collect();

        let (removed, kept_changed): (Vec<ServiceId>, Vec<String>) = {
            let state = self.state.read();
            let removed = state
                .definitions
                .keys()
                .filter(|id| !desired.contains_key(id))
                .copied()
                .collect();
            let kept_changed = state
                .definitions
                .values()
                .filter_map(|old| {
                    desired
                        .get(&old.id)
                        .filter(|new| new.tunables_differ(old))
                        .map(|new| new.name.clone())
                })
                .collect();
            (removed, kept_changed)
        };

        let mut results = Vec::new();

        // An id that disappeared is a different service now (or gone):
        // stop the old child before installing the new definitions
        for id in removed {
            let name = {
                let state = self.state.read();
                state
                    .definitions
                    .get(&id)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| id.to_string())
            };
            match self.stop_one(&id).await {
                Ok(true) => results.push(ServiceOpResult::ok_with(name, "stopped (removed from config)")),
                Ok(false) => {}
                Err(e) => results.push(ServiceOpResult::failed(name, e.to_string())),
            }
            let mut state = self.state.write();
            state.definitions.remove(&id);
        }

        for name in kept_changed {
            // Probe/restart tuning applies in place; the monitor re-reads
            // its definition every cycle, so nothing restarts
            results.push(ServiceOpResult::ok_with(name, "updated in place"));
        }

        {
            let mut state = self.state.write();
            state.definitions = desired.clone();
        }

        // Start anything desired and not running
        let to_start: Vec<ResolvedService> = {
            let state = self.state.read();
            desired
                .values()
                .filter(|d| {
                    state
                        .services
                        .get(&d.id)
                        .map(|r| !r.status.is_live())
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        for definition in to_start {
            let name = definition.name.clone();
            match self.start_one(&definition).await {
                Ok(StartOutcome::Started) => results.push(ServiceOpResult::ok(name)),
                Ok(StartOutcome::AlreadyRunning) => {}
                Err(e) => results.push(ServiceOpResult::failed(name, e.to_string())),
            }
        }

        self.sync_cluster_monitors(config);
        self.persist();

        results
    }

    /// Keep exactly one cluster poller per kubernetes context that wants
    /// cluster health
    fn sync_cluster_monitors(&self, config: &LocalportConfig) {
        let Some(cluster_config) = config.defaults.cluster_health.clone() else {
            return;
        };
        if !cluster_config.enabled {
            return;
        }

        let contexts: Vec<String> = {
            let state = self.state.read();
            let mut contexts: Vec<String> = state
                .definitions
                .values()
                .filter_map(|d| d.connection.kubernetes_context())
                .map(str::to_string)
                .collect();
            contexts.sort();
            contexts.dedup();
            contexts
        };

        let running: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|t| t.tags.iter().any(|tag| tag == "cluster"))
            .filter_map(|t| t.name.strip_prefix("cluster:").map(str::to_string))
            .collect();

        for context in &running {
            if !contexts.contains(context) {
                self.registry.cancel_by_tag(&format!("cluster:{}", context));
            }
        }

        for context in contexts {
            if running.contains(&context) {
                continue;
            }
            let token = CancellationToken::new();
            let handle = tokio::spawn(crate::health::run_cluster_monitor(
                context.clone(),
                cluster_config.clone(),
                self.state.clone(),
                token.clone(),
            ));
            self.registry.register(
                format!("cluster:{}", context),
                PRIORITY_CLUSTER,
                vec!["cluster".to_string(), format!("cluster:{}", context)],
                token,
                handle,
            );
        }
    }

    // =========================================================================
    // Internals: health / restart events
    // =========================================================================

    async fn on_health_change(
        &self,
        id: ServiceId,
        epoch: DateTime<Utc>,
        healthy: bool,
        detail: Option<String>,
    ) {
        if healthy {
            let mut state = self.state.write();
            if let Some(record) = state.services.get_mut(&id) {
                if record.epoch == Some(epoch)
                    && matches!(
                        record.status,
                        ServiceStatus::Running | ServiceStatus::Unhealthy | ServiceStatus::Starting
                    )
                {
                    record.status = ServiceStatus::Running;
                    record.last_error = None;
                }
            }
            return;
        }

        let should_handle = {
            let mut state = self.state.write();
            match state.services.get_mut(&id) {
                Some(record)
                    if record.epoch == Some(epoch)
                        && matches!(
                            record.status,
                            ServiceStatus::Running | ServiceStatus::Starting
                        ) =>
                {
                    record.status = ServiceStatus::Unhealthy;
                    record.last_error = detail;
                    true
                }
                _ => false, // stale epoch or restart already in flight
            }
        };

        if should_handle {
            self.decide_restart(id, epoch, true).await;
        }
    }

    /// Child died (waiter event or monitor PID check). Bypasses the
    /// failure threshold: a dead child is not a flaky probe.
    async fn on_child_lost(&self, id: ServiceId, epoch: DateTime<Utc>, detail: Option<String>) {
        let should_handle = {
            let mut state = self.state.write();
            match state.services.get_mut(&id) {
                Some(record)
                    if record.epoch == Some(epoch)
                        && matches!(
                            record.status,
                            ServiceStatus::Running
                                | ServiceStatus::Starting
                                | ServiceStatus::Unhealthy
                        ) =>
                {
                    record.status = ServiceStatus::Unhealthy;
                    record.health.verdict = HealthVerdict::Unhealthy;
                    record.pid = None;
                    if detail.is_some() {
                        record.last_error = detail;
                    }
                    true
                }
                _ => false,
            }
        };

        if should_handle {
            self.handles.lock().remove(&id);
            self.decide_restart(id, epoch, false).await;
        }
    }

    /// Ask the restart tracker and either schedule a respawn or fail the
    /// service. `child_alive` says whether there is still a process to
    /// terminate first.
    async fn decide_restart(&self, id: ServiceId, epoch: DateTime<Utc>, child_alive: bool) {
        let (policy, name, uptime) = {
            let state = self.state.read();
            let Some(definition) = state.definitions.get(&id) else {
                return;
            };
            let uptime = (Utc::now() - epoch).to_std().ok();
            (
                definition.restart_policy.clone(),
                definition.name.clone(),
                uptime,
            )
        };

        let decision = self.restarts.lock().decide(id, &policy, uptime);

        match decision {
            RestartDecision::Restart { attempt, delay } => {
                info!("Restarting {} in {:?} (attempt {})", name, delay, attempt);
                self.begin_restart(id, epoch, attempt, delay, child_alive).await;
            }
            RestartDecision::GiveUp => {
                warn!("Service {} has exhausted its restart policy, failing", name);
                if child_alive {
                    self.terminate_child(&id).await;
                }
                {
                    let mut state = self.state.write();
                    if let Some(record) = state.services.get_mut(&id) {
                        record.status = ServiceStatus::Failed;
                        record.pid = None;
                        record.next_retry_at = None;
                        if record.last_error.is_none() {
                            record.last_error =
                                Some("restart policy exhausted".to_string());
                        }
                    }
                }
                self.cancel_monitor(&id);
                self.persist();
            }
        }
    }

    async fn begin_restart(
        &self,
        id: ServiceId,
        epoch: DateTime<Utc>,
        attempt: u32,
        delay: Duration,
        child_alive: bool,
    ) {
        {
            let mut state = self.state.write();
            let Some(record) = state.services.get_mut(&id) else {
                return;
            };
            if record.epoch != Some(epoch) {
                return; // a different epoch won the race
            }
            record.status = ServiceStatus::Restarting;
            record.restart_attempt = attempt;
            record.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
        }

        if child_alive {
            self.terminate_child(&id).await;
        }
        self.persist();

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SupervisorEvent::RestartDue { id, attempt }).await;
        });
    }

    async fn on_restart_due(&self, id: ServiceId, attempt: u32) {
        let definition = {
            let state = self.state.read();
            let still_due = state
                .services
                .get(&id)
                .map(|r| r.status == ServiceStatus::Restarting && r.restart_attempt == attempt)
                .unwrap_or(false);
            if !still_due {
                return; // stopped or superseded while we were waiting
            }
            state.definitions.get(&id).cloned()
        };
        let Some(definition) = definition else {
            return;
        };

        match self.spawn_epoch(&definition).await {
            Ok(()) => {
                info!(
                    "Service {} restarted (attempt {})",
                    definition.name, attempt
                );
                self.register_monitor(id);
                self.persist();
            }
            Err(e) => {
                // A failed spawn consumes this attempt and rolls straight
                // into the next decision
                warn!(
                    "Respawn of {} failed (attempt {}): {}",
                    definition.name, attempt, e
                );
                {
                    let mut state = self.state.write();
                    if let Some(record) = state.services.get_mut(&id) {
                        record.last_error = Some(e.to_string());
                    }
                }
                let epoch = {
                    let state = self.state.read();
                    state.services.get(&id).and_then(|r| r.epoch)
                };
                if let Some(epoch) = epoch {
                    self.decide_restart(id, epoch, false).await;
                }
            }
        }
    }

    async fn terminate_child(&self, id: &ServiceId) {
        let (grace, pid) = {
            let state = self.state.read();
            (
                state
                    .definitions
                    .get(id)
                    .map(|d| d.stop_grace_period)
                    .unwrap_or(Duration::from_secs(5)),
                state.services.get(id).and_then(|r| r.pid),
            )
        };

        let handle = self.handles.lock().remove(id);
        match handle {
            Some(ForwardHandle::Spawned { stop_tx }) => {
                let _ = stop_tx.send(grace);
            }
            Some(ForwardHandle::Adopted { pid }) => {
                adapters::terminate_pid(pid, grace).await;
            }
            None => {}
        }

        if let Some(pid) = pid {
            let deadline = tokio::time::Instant::now() + grace + Duration::from_secs(2);
            while process_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let mut state = self.state.write();
        if let Some(record) = state.services.get_mut(id) {
            record.pid = None;
        }
    }

    // =========================================================================
    // Internals: shutdown support
    // =========================================================================

    /// Phase 1: refuse new starts
    pub fn set_draining(&self) {
        self.state.write().draining = true;
    }

    /// Phase 3: gracefully stop every child we know about
    pub async fn stop_all_children(&self) {
        let ids: Vec<ServiceId> = {
            let state = self.state.read();
            state
                .services
                .values()
                .filter(|r| r.status.is_live())
                .map(|r| r.id)
                .collect()
        };

        for id in ids {
            if let Err(e) = self.stop_one(&id).await {
                error!("Failed to stop {} during shutdown: {}", id, e);
            }
        }
    }

    /// Phase 4: SIGKILL anything still alive, write the final snapshot
    pub fn force_cleanup(&self) {
        let pids: Vec<u32> = {
            let state = self.state.read();
            state.services.values().filter_map(|r| r.pid).collect()
        };
        for pid in pids {
            adapters::force_kill_pid(pid);
        }
        {
            let mut state = self.state.write();
            state.services.clear();
        }
        self.handles.lock().clear();
        self.persist();
    }

    /// Any live children left? (used by shutdown verification)
    pub fn live_children(&self) -> Vec<u32> {
        let state = self.state.read();
        state
            .services
            .values()
            .filter_map(|r| r.pid)
            .filter(|pid| process_alive(*pid))
            .collect()
    }

    // =========================================================================
    // Internals: plumbing
    // =========================================================================

    /// Resolve a selector to definitions, plus names that matched nothing
    fn select(&self, selector: &ServiceSelector) -> (Vec<ResolvedService>, Vec<String>) {
        let state = self.state.read();
        let matched: Vec<ResolvedService> = state
            .definitions
            .values()
            .filter(|d| match selector {
                ServiceSelector::All => true,
                ServiceSelector::Names(names) => names.iter().any(|n| *n == d.name),
                ServiceSelector::Tags(tags) => tags.iter().any(|t| d.has_tag(t)),
            })
            .cloned()
            .collect();

        let unknown = match selector {
            ServiceSelector::Names(names) => names
                .iter()
                .filter(|n| !matched.iter().any(|d| d.name == **n))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };

        (matched, unknown)
    }

    fn register_monitor(&self, id: ServiceId) {
        // Replace any previous monitor for this id
        self.cancel_monitor(&id);

        let token = CancellationToken::new();
        let handle = spawn_health_monitor(
            id,
            self.state.clone(),
            self.events_tx.clone(),
            self.registry.activity(),
            token.clone(),
        );
        self.registry.register(
            format!("health:{}", id),
            PRIORITY_HEALTH,
            vec!["health".to_string(), id.to_string()],
            token,
            handle,
        );
    }

    fn cancel_monitor(&self, id: &ServiceId) {
        self.registry.cancel_by_tag(&id.to_string());
    }

    /// Route dead PIDs through the child-exit path so status never shows a
    /// running service with no process behind it
    fn sweep_dead_pids(&self) {
        let stale: Vec<(ServiceId, DateTime<Utc>)> = {
            let state = self.state.read();
            state
                .services
                .values()
                .filter(|r| r.status.is_live() && r.status != ServiceStatus::Restarting)
                .filter_map(|r| match (r.pid, r.epoch) {
                    (Some(pid), Some(epoch)) if !process_alive(pid) => Some((r.id, epoch)),
                    _ => None,
                })
                .collect()
        };

        for (id, epoch) in stale {
            let _ = self
                .events_tx
                .try_send(SupervisorEvent::ChildGone { id, epoch });
        }
    }

    /// Write the persisted snapshot: every record with a live child
    fn persist(&self) {
        let forwards: Vec<PersistedForward> = {
            let state = self.state.read();
            state
                .services
                .values()
                .filter(|r| r.status.is_live())
                .filter_map(|record| {
                    let definition = state.definitions.get(&record.id)?;
                    Some(PersistedForward {
                        service_id: record.id,
                        name: definition.name.clone(),
                        pid: record.pid?,
                        technology: definition.technology,
                        local_port: definition.local_port,
                        started_at: record.epoch?,
                        argv_fingerprint: record.argv_fingerprint.clone()?,
                    })
                })
                .collect()
        };

        if let Err(e) = self.store.save(forwards) {
            error!("Failed to persist state: {}", e);
        }
    }
}

enum StartOutcome {
    Started,
    AlreadyRunning,
}

fn selector_label(selector: &ServiceSelector) -> String {
    match selector {
        ServiceSelector::All => "all".to_string(),
        ServiceSelector::Names(names) => names.join(","),
        ServiceSelector::Tags(tags) => format!("tag:{}", tags.join(",")),
    }
}

#[cfg(test)]
mod tests;
