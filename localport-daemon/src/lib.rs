use std::path::PathBuf;

pub mod adapters;
pub mod config;
pub mod errors;
pub mod health;
pub mod identity;
pub mod monitor;
pub mod persistence;
pub mod ports;
pub mod restart;
pub mod service_log;
pub mod shutdown;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

const DATA_DIR_NAME: &str = "localport";
const LOCALPORT_HOME_ENV: &str = "LOCALPORT_HOME";

/// Daemon version string, embedded in service-log epoch headers
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Root of all daemon-owned files: `$XDG_DATA_HOME/localport` on Linux,
/// the platform data dir elsewhere, overridable via `LOCALPORT_HOME`.
pub fn data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(LOCALPORT_HOME_ENV) {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .expect("Could not determine platform data directory")
        .join(DATA_DIR_NAME)
}

pub struct Daemon {}

impl Daemon {
    pub fn data_dir() -> PathBuf {
        data_dir()
    }

    pub fn socket_path() -> PathBuf {
        data_dir().join("localport.sock")
    }

    pub fn pid_file() -> PathBuf {
        data_dir().join("localport.pid")
    }

    pub fn state_file() -> PathBuf {
        data_dir().join("state.json")
    }

    pub fn daemon_log_path() -> PathBuf {
        data_dir().join("logs").join("daemon.log")
    }

    pub fn service_logs_dir() -> PathBuf {
        data_dir().join("logs").join("services")
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .expect("Could not determine platform config directory")
            .join(DATA_DIR_NAME)
            .join("config.yaml")
    }
}
