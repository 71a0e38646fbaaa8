use chrono::{DateTime, Utc};
use localport_protocol::protocol::{OrphanInfo, ServiceStatusInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ResolvedService;
use crate::identity::ServiceId;

/// Supervisor lifecycle state of a service (distinct from health)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        }
    }

    /// States in which a child process is supposed to exist
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting
                | ServiceStatus::Running
                | ServiceStatus::Unhealthy
                | ServiceStatus::Restarting
        )
    }

    /// Terminal states within one configuration epoch
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last probe verdict for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthVerdict {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthVerdict::Unknown => "unknown",
            HealthVerdict::Healthy => "healthy",
            HealthVerdict::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record: verdict plus when and why
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub verdict: HealthVerdict,
    pub last_checked: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

/// Live record for a service that is currently supposed to be up.
/// Created by the supervisor on spawn, mutated by the supervisor
/// (lifecycle, counters) and the health monitor (health, counters),
/// destroyed on stop or removal from configuration.
#[derive(Debug, Clone)]
pub struct RunningService {
    pub id: ServiceId,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    /// Start of the current child epoch; also the guard against stale
    /// health callbacks from a previous epoch
    pub epoch: Option<DateTime<Utc>>,
    pub health: HealthRecord,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub restart_attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub log_path: Option<PathBuf>,
    pub last_error: Option<String>,
    /// Fingerprint of the argv the current child was spawned with;
    /// persisted so a daemon restart can tell our PID from a reused one
    pub argv_fingerprint: Option<String>,
    /// True when this record was adopted from persisted state rather than
    /// spawned by this daemon process
    pub adopted: bool,
}

impl RunningService {
    pub fn new(id: ServiceId) -> Self {
        Self {
            id,
            status: ServiceStatus::Starting,
            pid: None,
            epoch: None,
            health: HealthRecord::default(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            restart_attempt: 0,
            next_retry_at: None,
            log_path: None,
            last_error: None,
            argv_fingerprint: None,
            adopted: false,
        }
    }

    /// Reset per-epoch bookkeeping when a new child starts
    pub fn begin_epoch(&mut self, pid: u32, started_at: DateTime<Utc>) {
        self.pid = Some(pid);
        self.epoch = Some(started_at);
        self.health = HealthRecord::default();
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.next_retry_at = None;
    }

    /// Placeholder row for a configured service with no live record
    pub fn stopped_placeholder(mut self) -> Self {
        self.status = ServiceStatus::Stopped;
        self
    }

    pub fn to_status_info(&self, definition: &ResolvedService) -> ServiceStatusInfo {
        ServiceStatusInfo {
            id: self.id.to_string(),
            name: definition.name.clone(),
            technology: definition.technology.as_str().to_string(),
            local_port: definition.local_port,
            remote_port: definition.remote_port,
            state: self.status.as_str().to_string(),
            health: self.health.verdict.as_str().to_string(),
            pid: self.pid,
            started_at: self.epoch.map(|dt| dt.timestamp()),
            restart_attempts: self.restart_attempt,
            tags: definition.tags.clone(),
            log_path: self.log_path.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// A persisted PID whose configuration entry no longer exists
#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub id: ServiceId,
    pub name: String,
    pub pid: u32,
    pub local_port: u16,
}

impl OrphanEntry {
    pub fn to_info(&self) -> OrphanInfo {
        OrphanInfo {
            id: self.id.to_string(),
            name: self.name.clone(),
            pid: self.pid,
            local_port: self.local_port,
        }
    }
}

/// Last cluster-poller verdict for one kubernetes context
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Global daemon state. Single writer (the supervisor); readers snapshot
/// under the table lock.
pub struct DaemonState {
    /// Desired services from the current configuration epoch
    pub definitions: HashMap<ServiceId, ResolvedService>,
    /// Live table, keyed by service id
    pub services: HashMap<ServiceId, RunningService>,
    /// Persisted PIDs whose configuration went away
    pub orphans: Vec<OrphanEntry>,
    /// Per-context cluster health (kubernetes contexts with cluster_health
    /// enabled)
    pub cluster_health: HashMap<String, ClusterStatus>,
    /// Set during shutdown Phase 1; start requests are refused
    pub draining: bool,
    pub started_at: DateTime<Utc>,
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            services: HashMap::new(),
            orphans: Vec::new(),
            cluster_health: HashMap::new(),
            draining: false,
            started_at: Utc::now(),
        }
    }

    pub fn definition(&self, id: &ServiceId) -> Option<&ResolvedService> {
        self.definitions.get(id)
    }

    pub fn definition_by_name(&self, name: &str) -> Option<&ResolvedService> {
        self.definitions.values().find(|d| d.name == name)
    }

    /// Whether the kubernetes context of this service is currently failing
    /// its cluster poller
    pub fn cluster_unhealthy_for(&self, definition: &ResolvedService) -> bool {
        definition
            .connection
            .kubernetes_context()
            .and_then(|ctx| self.cluster_health.get(ctx))
            .map(|status| !status.healthy)
            .unwrap_or(false)
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for daemon state
pub type SharedDaemonState = Arc<RwLock<DaemonState>>;

pub fn new_shared_state() -> SharedDaemonState {
    Arc::new(RwLock::new(DaemonState::new()))
}

#[cfg(test)]
mod tests;
