//! Declarative configuration for LocalPort
//!
//! The YAML document describes the desired set of forwards. Loading
//! performs `${VAR}` expansion against the daemon environment, parses with
//! field-precise error paths, validates, and resolves each entry against
//! the `defaults` section into a [`ResolvedService`].

pub mod duration;
pub mod expand;
mod health;
mod restart;

pub use health::{
    ClusterCommands, ClusterHealthConfig, HealthCheckConfig, ProbeKind, ProbeSettings,
};
pub use restart::RestartPolicy;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{DaemonError, Result};
use crate::identity::ServiceId;
use duration::{deserialize_duration, serialize_duration};

/// Forwarding technology for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    #[serde(alias = "kubectl")]
    Kubernetes,
    Ssh,
}

impl Technology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::Kubernetes => "kubernetes",
            Technology::Ssh => "ssh",
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes connection details
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KubernetesConnection {
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    pub resource_name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// SSH connection details. A password, if unavoidable, is named by the
/// environment variable carrying it; it never appears in config or argv.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SshConnection {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

/// Technology-specific connection record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Kubernetes(KubernetesConnection),
    Ssh(SshConnection),
}

impl Connection {
    /// Short human-readable summary for log headers and status output
    pub fn summary(&self) -> String {
        match self {
            Connection::Kubernetes(k) => match &k.context {
                Some(ctx) => format!(
                    "{}/{} in {} (context {})",
                    k.resource_type, k.resource_name, k.namespace, ctx
                ),
                None => format!("{}/{} in {}", k.resource_type, k.resource_name, k.namespace),
            },
            Connection::Ssh(s) => match &s.user {
                Some(user) => format!("{}@{}:{}", user, s.host, s.port),
                None => format!("{}:{}", s.host, s.port),
            },
        }
    }

    pub fn kubernetes_context(&self) -> Option<&str> {
        match self {
            Connection::Kubernetes(k) => k.context.as_deref(),
            Connection::Ssh(_) => None,
        }
    }
}

/// One raw service entry as written in YAML. `connection` stays untyped
/// until resolution because its shape depends on the sibling `technology`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub technology: Technology,
    pub local_port: u16,
    pub remote_port: u16,
    pub connection: serde_yaml::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_grace",
        serialize_with = "serialize_optional_grace"
    )]
    pub stop_grace_period: Option<Duration>,
}

fn deserialize_optional_grace<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_duration(deserializer).map(Some)
}

fn serialize_optional_grace<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match duration {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}

/// The `defaults` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_health: Option<ClusterHealthConfig>,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalportConfig {
    pub version: String,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// A service entry with defaults applied, connection typed, and identity
/// computed. Immutable within one configuration epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub id: ServiceId,
    pub name: String,
    pub technology: Technology,
    pub local_port: u16,
    pub remote_port: u16,
    pub connection: Connection,
    pub enabled: bool,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub health_check: HealthCheckConfig,
    pub restart_policy: RestartPolicy,
    pub stop_grace_period: Duration,
}

impl ResolvedService {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Fields that do NOT participate in identity (tags, description,
    /// probe/restart tuning) may differ between two resolutions of the
    /// same id; this tells reconciliation whether an in-place update
    /// suffices.
    pub fn tunables_differ(&self, other: &ResolvedService) -> bool {
        self.health_check != other.health_check
            || self.restart_policy != other.restart_policy
            || self.tags != other.tags
            || self.description != other.description
            || self.stop_grace_period != other.stop_grace_period
    }
}

/// Maximum config file size (1MB) to prevent OOM from accidentally large files
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

impl LocalportConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` references
    /// against the daemon's environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, &expand::daemon_env())
    }

    /// Load with an explicit environment map (tests use this)
    pub fn load_with_env(path: &Path, env: &HashMap<String, String>) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DaemonError::ConfigNotFound(path.to_path_buf())
            } else {
                DaemonError::Internal(format!("Failed to stat config '{}': {}", path.display(), e))
            }
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(DaemonError::Config(format!(
                "Config file '{}' is too large ({} bytes, max {} bytes)",
                path.display(),
                metadata.len(),
                MAX_CONFIG_FILE_SIZE,
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Internal(format!("Failed to read config '{}': {}", path.display(), e))
        })?;

        Self::parse(&contents, path, env)
    }

    /// Parse and validate a YAML document
    pub fn parse(contents: &str, path: &Path, env: &HashMap<String, String>) -> Result<Self> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(contents).map_err(|e| {
            DaemonError::Config(format!("Failed to parse config '{}': {}", path.display(), e))
        })?;

        expand::expand_yaml_value(&mut value, env);

        let config: LocalportConfig =
            serde_path_to_error::deserialize(value).map_err(|e| DaemonError::ConfigParse {
                path: path.to_path_buf(),
                source: e,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Structural validation that applies to the whole document.
    /// Per-service problems that only affect one service (say, a bad probe
    /// config) are surfaced during `resolve_services` so one broken entry
    /// does not take the rest of the fleet down.
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut ports = HashMap::new();

        for entry in &self.services {
            if entry.name.is_empty() {
                return Err(DaemonError::Config("service with empty name".to_string()));
            }
            if !names.insert(entry.name.clone()) {
                return Err(DaemonError::Config(format!(
                    "duplicate service name: {}",
                    entry.name
                )));
            }
            if entry.local_port == 0 {
                return Err(DaemonError::Config(format!(
                    "service {}: local_port must be 1-65535",
                    entry.name
                )));
            }
            if entry.remote_port == 0 {
                return Err(DaemonError::Config(format!(
                    "service {}: remote_port must be 1-65535",
                    entry.name
                )));
            }
            if entry.enabled {
                if let Some(holder) = ports.insert(entry.local_port, entry.name.clone()) {
                    return Err(DaemonError::Config(format!(
                        "services {} and {} both claim local port {}",
                        holder, entry.name, entry.local_port
                    )));
                }
            }
        }

        self.defaults
            .restart_policy
            .validate()
            .map_err(|e| DaemonError::Config(format!("defaults.restart_policy: {}", e)))?;
        self.defaults
            .health_check
            .validate()
            .map_err(|e| DaemonError::Config(format!("defaults.health_check: {}", e)))?;

        Ok(())
    }

    /// Resolve every enabled entry into a typed service definition.
    /// Returns resolved services plus per-entry failures (entry name,
    /// message) for entries that could not be resolved.
    pub fn resolve_services(&self) -> (Vec<ResolvedService>, Vec<(String, String)>) {
        let mut resolved = Vec::new();
        let mut failures = Vec::new();

        for entry in &self.services {
            if !entry.enabled {
                continue;
            }
            match self.resolve_entry(entry) {
                Ok(service) => resolved.push(service),
                Err(e) => failures.push((entry.name.clone(), e.to_string())),
            }
        }

        (resolved, failures)
    }

    fn resolve_entry(&self, entry: &ServiceEntry) -> Result<ResolvedService> {
        let connection = match entry.technology {
            Technology::Kubernetes => {
                let conn: KubernetesConnection =
                    serde_yaml::from_value(entry.connection.clone()).map_err(|e| {
                        DaemonError::Config(format!(
                            "service {}: invalid kubernetes connection: {}",
                            entry.name, e
                        ))
                    })?;
                Connection::Kubernetes(conn)
            }
            Technology::Ssh => {
                let conn: SshConnection = serde_yaml::from_value(entry.connection.clone())
                    .map_err(|e| {
                        DaemonError::Config(format!(
                            "service {}: invalid ssh connection: {}",
                            entry.name, e
                        ))
                    })?;
                Connection::Ssh(conn)
            }
        };

        let health_check = entry
            .health_check
            .clone()
            .unwrap_or_else(|| self.defaults.health_check.clone());
        health_check
            .validate()
            .map_err(|e| DaemonError::Config(format!("service {}: {}", entry.name, e)))?;

        let restart_policy = entry
            .restart_policy
            .clone()
            .unwrap_or_else(|| self.defaults.restart_policy.clone());
        restart_policy
            .validate()
            .map_err(|e| DaemonError::Config(format!("service {}: {}", entry.name, e)))?;

        let id = ServiceId::derive(
            &entry.name,
            entry.technology,
            entry.local_port,
            entry.remote_port,
            &connection,
        );

        Ok(ResolvedService {
            id,
            name: entry.name.clone(),
            technology: entry.technology,
            local_port: entry.local_port,
            remote_port: entry.remote_port,
            connection,
            enabled: entry.enabled,
            tags: entry.tags.clone(),
            description: entry.description.clone(),
            health_check,
            restart_policy,
            stop_grace_period: entry.stop_grace_period.unwrap_or(DEFAULT_STOP_GRACE),
        })
    }
}

fn default_resource_type() -> String {
    "service".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_enabled() -> bool {
    true
}
