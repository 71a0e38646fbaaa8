use std::path::PathBuf;
use thiserror::Error;

/// Format a YAML error for user-friendly display, including the field path
fn format_yaml_error(e: &serde_path_to_error::Error<serde_yaml::Error>) -> String {
    let path = e.path().to_string();
    let inner = e.inner();
    let msg = inner.to_string();

    let located = if let Some(loc) = inner.location() {
        format!("Line {}, Column {}: {}", loc.line(), loc.column(), msg)
    } else {
        msg
    };

    if path.is_empty() {
        located
    } else {
        format!("{}: {}", path, located)
    }
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file '{path}':\n  {}", format_yaml_error(.source))]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Forwarder binary '{binary}' not found on PATH (required by service {service})")]
    ForwarderMissing { service: String, binary: String },

    #[error("Port {port} is held by {holder} (not managed by localport)")]
    PortConflict { port: u16, holder: String },

    #[error("Failed to spawn forwarder for service {service}: {source}")]
    ProcessSpawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service log error for {service}: {source}")]
    ServiceLog {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist state to '{path}': {message}")]
    StatePersist { path: PathBuf, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
