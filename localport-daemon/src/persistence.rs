//! Persisted daemon state
//!
//! `state.json` records one entry per running forward so that a restarted
//! daemon can reconcile: re-adopt children it spawned, report orphans, and
//! distinguish its own PIDs from foreign port holders. The file is always
//! replaced whole via tempfile + rename, so readers see either the previous
//! snapshot or the next one, never a partial write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Technology;
use crate::errors::{DaemonError, Result};
use crate::identity::ServiceId;

const STATE_VERSION: u32 = 1;

/// One persisted forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedForward {
    pub service_id: ServiceId,
    pub name: String,
    pub pid: u32,
    pub technology: Technology,
    pub local_port: u16,
    pub started_at: DateTime<Utc>,
    /// SHA-256 over the spawn argv (secrets excluded); a PID whose command
    /// no longer matches this fingerprint is never adopted
    pub argv_fingerprint: String,
}

/// On-disk snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub forwards: Vec<PersistedForward>,
}

/// Store for `state.json`. Single writer: the supervisor.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is an empty state; a corrupt file
    /// is logged and treated as empty rather than blocking startup.
    pub fn load(&self) -> PersistedState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return PersistedState::default();
            }
            Err(e) => {
                warn!("Failed to read state file {:?}: {}", self.path, e);
                return PersistedState::default();
            }
        };

        match serde_json::from_str::<PersistedState>(&content) {
            Ok(state) => {
                debug!(
                    "Loaded persisted state with {} forwards from {:?}",
                    state.forwards.len(),
                    self.path
                );
                state
            }
            Err(e) => {
                warn!("Failed to parse state file {:?}, ignoring: {}", self.path, e);
                PersistedState::default()
            }
        }
    }

    /// Replace the snapshot atomically (write temp + rename)
    pub fn save(&self, forwards: Vec<PersistedForward>) -> Result<()> {
        let state = PersistedState {
            version: STATE_VERSION,
            forwards,
        };

        let content = serde_json::to_string_pretty(&state).map_err(|e| {
            DaemonError::StatePersist {
                path: self.path.clone(),
                message: format!("serialize failed: {}", e),
            }
        })?;

        let parent = self.path.parent().ok_or_else(|| DaemonError::StatePersist {
            path: self.path.clone(),
            message: "no parent directory".to_string(),
        })?;

        std::fs::create_dir_all(parent).map_err(|e| DaemonError::StatePersist {
            path: self.path.clone(),
            message: format!("cannot create {}: {}", parent.display(), e),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            DaemonError::StatePersist {
                path: self.path.clone(),
                message: format!("cannot create temp file: {}", e),
            }
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| DaemonError::StatePersist {
                    path: self.path.clone(),
                    message: format!("cannot set permissions: {}", e),
                })?;
        }

        tmp.write_all(content.as_bytes())
            .map_err(|e| DaemonError::StatePersist {
                path: self.path.clone(),
                message: format!("write failed: {}", e),
            })?;

        tmp.as_file().sync_all().map_err(|e| DaemonError::StatePersist {
            path: self.path.clone(),
            message: format!("fsync failed: {}", e),
        })?;

        tmp.persist(&self.path).map_err(|e| DaemonError::StatePersist {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        debug!("Persisted {} forwards to {:?}", state.forwards.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
