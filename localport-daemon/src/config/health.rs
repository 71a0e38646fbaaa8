//! Health check configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::duration::{deserialize_duration, serialize_duration};

/// Probe kind selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Tcp,
    Http,
    Kafka,
    Postgres,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Tcp => "tcp",
            ProbeKind::Http => "http",
            ProbeKind::Kafka => "kafka",
            ProbeKind::Postgres => "postgres",
        }
    }
}

/// Kind-specific probe settings. One bag of optional fields rather than a
/// tagged enum so that `defaults.health_check.config` can be partially
/// overridden per service; `validate_for` enforces the per-kind shape.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ProbeSettings {
    // http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    // kafka
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_servers: Option<String>,

    // postgres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ProbeSettings {
    /// Check that the settings make sense for the chosen kind
    pub fn validate_for(&self, kind: ProbeKind) -> std::result::Result<(), String> {
        match kind {
            ProbeKind::Tcp => Ok(()),
            ProbeKind::Http => {
                if let Some(ref method) = self.method {
                    let m = method.to_uppercase();
                    if !matches!(m.as_str(), "GET" | "HEAD" | "POST" | "PUT" | "OPTIONS") {
                        return Err(format!("unsupported http method: {}", method));
                    }
                }
                Ok(())
            }
            ProbeKind::Kafka => Ok(()),
            ProbeKind::Postgres => {
                if self.database.is_none() {
                    return Err("postgres probe requires config.database".to_string());
                }
                if self.user.is_none() {
                    return Err("postgres probe requires config.user".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Health check configuration for one service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default)]
    pub config: ProbeSettings,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Tcp,
            interval: default_interval(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            config: ProbeSettings::default(),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.interval.is_zero() {
            return Err("health_check.interval must be positive".to_string());
        }
        if self.timeout.is_zero() {
            return Err("health_check.timeout must be positive".to_string());
        }
        if self.failure_threshold == 0 {
            return Err("health_check.failure_threshold must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            return Err("health_check.success_threshold must be at least 1".to_string());
        }
        self.config.validate_for(self.kind)
    }
}

/// Out-of-band cluster health polling (kubernetes contexts only)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterHealthConfig {
    #[serde(default = "default_cluster_enabled")]
    pub enabled: bool,
    #[serde(
        default = "default_cluster_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_cluster_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub commands: ClusterCommands,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterCommands {
    #[serde(default = "default_true")]
    pub cluster_info: bool,
    #[serde(default)]
    pub pod_status: bool,
    #[serde(default)]
    pub node_status: bool,
    #[serde(default)]
    pub events_on_failure: bool,
}

impl Default for ClusterCommands {
    fn default() -> Self {
        Self {
            cluster_info: true,
            pod_status: false,
            node_status: false,
            events_on_failure: false,
        }
    }
}

impl Default for ClusterHealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_cluster_enabled(),
            interval: default_cluster_interval(),
            timeout: default_cluster_timeout(),
            commands: ClusterCommands::default(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

fn default_cluster_enabled() -> bool {
    false
}

fn default_cluster_interval() -> Duration {
    Duration::from_secs(240)
}

fn default_cluster_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}
