//! Subprocess adapters for the forwarding technologies
//!
//! Adapters build the argv for the external forwarder (kubectl / ssh) and
//! spawn it detached: new process group, stdin/stdout/stderr redirected to
//! the service log file, no pipes retained in the parent. Retaining pipes
//! keeps the child tied to the daemon's lifetime, which breaks the
//! persistence-across-restarts model. Only the PID and a child handle for
//! reaping are kept.

mod kubectl;
mod ssh;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Connection, ResolvedService};
use crate::errors::{DaemonError, Result};
use crate::identity::ServiceId;
use crate::service_log::{EpochHeader, ServiceLog};

/// A fully built forwarder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child. Values never enter argv or the
    /// fingerprint; this is how ssh passwords travel.
    pub env: Vec<(String, String)>,
}

impl ForwardCommand {
    /// Stable SHA-256 over the argv (program + args). Secrets live in
    /// `env` and are excluded, so the fingerprint is safe to persist and
    /// lets reconciliation detect a reused PID running something else.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.program.as_bytes());
        for arg in &self.args {
            hasher.update([0u8]);
            hasher.update(arg.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// Build the forwarder command for a service, dispatching on technology
pub fn command_for(service: &ResolvedService) -> Result<ForwardCommand> {
    match &service.connection {
        Connection::Kubernetes(k8s) => kubectl::command(service, k8s),
        Connection::Ssh(ssh) => ssh::command(service, ssh),
    }
}

/// The fingerprint the current configuration would produce for a service
pub fn expected_fingerprint(service: &ResolvedService) -> Result<String> {
    Ok(command_for(service)?.fingerprint())
}

/// Look for an executable on PATH
pub fn find_binary(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

/// Natural exit of a forwarder child, delivered to the supervisor
#[derive(Debug)]
pub struct ForwardExit {
    pub id: ServiceId,
    pub epoch: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Stop request for a monitored child: grace period before SIGKILL
pub type StopTx = oneshot::Sender<Duration>;

/// A spawned forward under management
pub struct SpawnedForward {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub argv_fingerprint: String,
    /// Send the grace period to request termination; the monitor task does
    /// TERM -> bounded wait -> KILL on the whole process group
    pub stop_tx: StopTx,
}

/// Spawn the forwarder detached and start its monitor task.
///
/// The monitor owns the `Child` (reaping it on exit) and reports natural
/// exits on `exit_tx`; a requested stop suppresses the exit event so a
/// deliberate termination never looks like a crash.
pub fn spawn_forward(
    service: &ResolvedService,
    command: &ForwardCommand,
    log: &ServiceLog,
    exit_tx: mpsc::Sender<ForwardExit>,
) -> Result<SpawnedForward> {
    let log_file = log.open_for_epoch()?;
    let stdout = log_file.try_clone().map_err(|e| DaemonError::ServiceLog {
        service: service.name.clone(),
        source: e,
    })?;
    let stderr = log_file.try_clone().map_err(|e| DaemonError::ServiceLog {
        service: service.name.clone(),
        source: e,
    })?;

    debug!(
        "Spawning forwarder for {}: {}",
        service.name,
        command.display()
    );

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    // New process group: detaches the child from our controlling terminal
    // and lets stop() signal the forwarder plus any helpers it forked
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| DaemonError::ProcessSpawn {
        service: service.name.clone(),
        source: e,
    })?;

    // The log file handles passed to the child are the only writers; the
    // parent's copy drops here
    drop(log_file);

    let pid = child.id().ok_or_else(|| DaemonError::ProcessSpawn {
        service: service.name.clone(),
        source: std::io::Error::other("child exited before PID could be read"),
    })?;

    let started_at = Utc::now();

    log.write_epoch_header(&EpochHeader {
        service_id: service.id,
        service_name: service.name.clone(),
        pid,
        local_port: service.local_port,
        remote_port: service.remote_port,
        technology: service.technology.as_str().to_string(),
        connection_summary: service.connection.summary(),
        started_at,
    })?;

    info!(
        "Service {} forwarder started (pid {}, 127.0.0.1:{} -> {})",
        service.name, pid, service.local_port, service.remote_port
    );

    let (stop_tx, stop_rx) = oneshot::channel();
    let id = service.id;
    let name = service.name.clone();

    tokio::spawn(async move {
        monitor_child(id, name, started_at, &mut child, stop_rx, exit_tx).await;
    });

    Ok(SpawnedForward {
        pid,
        started_at,
        argv_fingerprint: command.fingerprint(),
        stop_tx,
    })
}

/// Wait for either natural exit (report it) or a stop request (terminate
/// the process group gracefully, escalating to SIGKILL after the grace
/// period, and report nothing).
async fn monitor_child(
    id: ServiceId,
    name: String,
    epoch: DateTime<Utc>,
    child: &mut tokio::process::Child,
    stop_rx: oneshot::Receiver<Duration>,
    exit_tx: mpsc::Sender<ForwardExit>,
) {
    tokio::select! {
        result = child.wait() => {
            let status = result.ok();
            let exit_code = status.as_ref().and_then(|s| s.code());
            #[cfg(unix)]
            let signal = status.as_ref().and_then(|s| {
                use std::os::unix::process::ExitStatusExt;
                s.signal()
            });
            #[cfg(not(unix))]
            let signal = None;

            info!(
                "Service {} forwarder exited with code {:?} signal {:?}",
                name, exit_code, signal
            );

            if exit_tx
                .send(ForwardExit { id, epoch, exit_code, signal })
                .await
                .is_err()
            {
                debug!("Exit channel closed, dropping exit event for {}", name);
            }
        }
        grace = stop_rx => {
            let grace = grace.unwrap_or(Duration::from_secs(5));
            let Some(pid) = child.id() else {
                let _ = child.wait().await;
                return;
            };

            debug!("Stopping {} forwarder (pid {}, grace {:?})", name, pid, grace);
            signal_group(pid, TermSignal::Terminate);

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Service {} forwarder stopped with {:?}", name, status);
                }
                Ok(Err(e)) => {
                    warn!("Error waiting for {} forwarder: {}", name, e);
                }
                Err(_) => {
                    warn!(
                        "Service {} forwarder did not stop within {:?}, killing",
                        name, grace
                    );
                    signal_group(pid, TermSignal::Kill);
                    let _ = child.wait().await; // reap
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, which: TermSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match which {
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _which: TermSignal) {}

/// Whether a process with this PID still exists (signal 0 probe)
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Terminate a process we are not holding a `Child` for (adopted forwards,
/// orphan cleanup): TERM to the group, bounded wait, then KILL.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !process_alive(pid) {
        return true;
    }

    info!("Terminating process group {} (SIGTERM)", pid);
    signal_group(pid, TermSignal::Terminate);

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        tokio::time::sleep(poll).await;
        waited += poll;
        if !process_alive(pid) {
            debug!("Process {} terminated gracefully", pid);
            return true;
        }
    }

    warn!("Process {} did not respond to SIGTERM, sending SIGKILL", pid);
    signal_group(pid, TermSignal::Kill);
    tokio::time::sleep(poll).await;
    !process_alive(pid)
}

/// Immediate SIGKILL to the process group (shutdown Phase 4)
pub fn force_kill_pid(pid: u32) {
    if process_alive(pid) {
        warn!("Force-killing process group {}", pid);
        signal_group(pid, TermSignal::Kill);
    }
}

/// Read a process's start time from /proc for PID-reuse detection.
/// Returns a Unix timestamp, or None when it cannot be determined.
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<i64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;

    // Field 22 (starttime, in clock ticks since boot) comes after the
    // parenthesized comm, which may itself contain spaces
    let end_paren = stat.rfind(')')?;
    let fields: Vec<&str> = stat[end_paren + 2..].split_whitespace().collect();
    let starttime_ticks: u64 = fields.get(19)?.parse().ok()?;

    let boot_time = boot_time()?;
    let ticks_per_sec = 100; // sysconf(_SC_CLK_TCK) default on Linux

    Some(boot_time + (starttime_ticks / ticks_per_sec) as i64)
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: u32) -> Option<i64> {
    None
}

#[cfg(target_os = "linux")]
fn boot_time() -> Option<i64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests;
