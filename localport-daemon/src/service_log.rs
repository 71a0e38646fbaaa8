//! Per-service log files
//!
//! Each forward appends to one text file under
//! `<data>/logs/services/<name>_<short-id>.log`. The child writes to the
//! file directly (the parent keeps no pipe, see the adapters module), so
//! rotation happens between epochs: renaming a file a live child still has
//! open would silently redirect its output into the rotated copy. Rotated
//! files get numeric suffixes (`.1` newest), and a retention sweep deletes
//! rotations past the age window or the count cap.

use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{DaemonError, Result};
use crate::identity::ServiceId;

/// Size threshold that triggers rotation at the next epoch boundary
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Rotated files older than this are deleted by the sweep
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// At most this many rotated files are kept per service
pub const DEFAULT_MAX_ROTATIONS: usize = 5;

/// Epoch header fields, written at the top of every new child epoch
#[derive(Debug, Clone)]
pub struct EpochHeader {
    pub service_id: ServiceId,
    pub service_name: String,
    pub pid: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub technology: String,
    pub connection_summary: String,
    pub started_at: DateTime<Utc>,
}

/// Handle on one service's log file
pub struct ServiceLog {
    path: PathBuf,
    service_name: String,
    max_size: u64,
}

impl ServiceLog {
    pub fn new(logs_dir: &Path, service_name: &str, id: &ServiceId) -> Self {
        // Sanitize service name for the filesystem
        let safe_name = service_name.replace(['/', '\\', ':', ' '], "_");
        let path = logs_dir.join(format!("{}_{}.log", safe_name, id.short()));
        Self {
            path,
            service_name: service_name.to_string(),
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepare the file for a new epoch: rotate if the previous epoch left
    /// it over the size threshold, then open it append-mode for the child.
    pub fn open_for_epoch(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DaemonError::ServiceLog {
                service: self.service_name.clone(),
                source: e,
            })?;
        }

        if let Ok(meta) = std::fs::metadata(&self.path) {
            if meta.len() >= self.max_size {
                self.rotate()?;
            }
        }

        self.open_append()
    }

    /// Append the structured epoch header. Called right after spawn, once
    /// the child PID is known; the child's first output lands after it in
    /// practice because forwarder binaries take longer than a write to
    /// start talking.
    pub fn write_epoch_header(&self, header: &EpochHeader) -> Result<()> {
        let mut file = self.open_append()?;
        let block = format!(
            "# ---- localport epoch ----\n\
             # service: {} ({})\n\
             # pid: {}\n\
             # forward: 127.0.0.1:{} -> {} via {}\n\
             # connection: {}\n\
             # platform: {} {}\n\
             # daemon: localport {}\n\
             # started: {}\n",
            header.service_name,
            header.service_id,
            header.pid,
            header.local_port,
            header.remote_port,
            header.technology,
            header.connection_summary,
            std::env::consts::OS,
            std::env::consts::ARCH,
            crate::VERSION,
            header.started_at.to_rfc3339(),
        );
        file.write_all(block.as_bytes())
            .map_err(|e| DaemonError::ServiceLog {
                service: self.service_name.clone(),
                source: e,
            })?;
        file.flush().map_err(|e| DaemonError::ServiceLog {
            service: self.service_name.clone(),
            source: e,
        })
    }

    /// Shift rotations up (`.1` -> `.2`, ...) and rename the current file
    /// to `.1`. Atomic per step; the current path is free afterwards.
    fn rotate(&self) -> Result<()> {
        debug!("Rotating service log {:?}", self.path);

        // First free suffix, then shift every existing rotation up one
        let mut index = 1;
        while self.rotated_path(index).exists() {
            index += 1;
        }
        while index > 1 {
            std::fs::rename(self.rotated_path(index - 1), self.rotated_path(index)).map_err(
                |e| DaemonError::ServiceLog {
                    service: self.service_name.clone(),
                    source: e,
                },
            )?;
            index -= 1;
        }

        std::fs::rename(&self.path, self.rotated_path(1)).map_err(|e| {
            DaemonError::ServiceLog {
                service: self.service_name.clone(),
                source: e,
            }
        })
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut os_string = self.path.clone().into_os_string();
        os_string.push(format!(".{}", index));
        PathBuf::from(os_string)
    }

    fn open_append(&self) -> Result<File> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&self.path)
                .map_err(|e| DaemonError::ServiceLog {
                    service: self.service_name.clone(),
                    source: e,
                })
        }
        #[cfg(not(unix))]
        {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| DaemonError::ServiceLog {
                    service: self.service_name.clone(),
                    source: e,
                })
        }
    }
}

/// Delete rotated service logs past the retention window or count cap.
/// Runs periodically from the daemon's sweeper task.
pub fn sweep_rotated_logs(logs_dir: &Path, retention: Duration, max_rotations: usize) {
    let entries = match std::fs::read_dir(logs_dir) {
        Ok(entries) => entries,
        Err(_) => return, // nothing logged yet
    };

    // Group rotations by their base log name
    let mut by_base: std::collections::HashMap<PathBuf, Vec<(usize, PathBuf)>> =
        std::collections::HashMap::new();

    for entry in entries.flatten() {
        let path = entry.path();
        let Some((base, index)) = split_rotation(&path) else {
            continue;
        };
        by_base.entry(base).or_default().push((index, path));
    }

    let now = std::time::SystemTime::now();

    for (_, mut rotations) in by_base {
        rotations.sort_by_key(|(index, _)| *index);

        for (position, (_, path)) in rotations.iter().enumerate() {
            let too_many = position >= max_rotations;
            let too_old = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > retention)
                .unwrap_or(false);

            if too_many || too_old {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to delete rotated log {:?}: {}", path, e);
                } else {
                    debug!("Deleted rotated log {:?}", path);
                }
            }
        }
    }
}

/// Split "<base>.log.N" into (base path ending in .log, N)
fn split_rotation(path: &Path) -> Option<(PathBuf, usize)> {
    let name = path.file_name()?.to_str()?;
    let (base, suffix) = name.rsplit_once('.')?;
    let index: usize = suffix.parse().ok()?;
    if !base.ends_with(".log") {
        return None;
    }
    Some((path.with_file_name(base), index))
}
