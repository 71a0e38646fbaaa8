//! Local port occupancy checks
//!
//! Before spawning a forwarder the supervisor needs to know whether the
//! local port is already held, and by whom: our own persisted PID (handled
//! by adoption), an orphan, or a foreign process (hard refusal, never
//! signaled). PID resolution parses `/proc/net/tcp` for a LISTEN socket on
//! the port and matches its inode against `/proc/<pid>/fd`; the process
//! name comes from the system process table.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tracing::debug;

/// Who (if anyone) holds a local TCP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub pid: Option<u32>,
    pub process_name: Option<String>,
}

impl PortHolder {
    /// Diagnostic string for conflict errors
    pub fn describe(&self) -> String {
        match (self.pid, &self.process_name) {
            (Some(pid), Some(name)) => format!("pid {} ({})", pid, name),
            (Some(pid), None) => format!("pid {}", pid),
            _ => "an unknown process".to_string(),
        }
    }
}

/// Check whether anything is listening on `127.0.0.1:port`.
///
/// Returns `None` when the port is free. PID attribution is best-effort:
/// a connect may succeed while `/proc` attribution fails (permissions,
/// non-Linux), in which case the holder has no pid.
pub async fn find_listener(port: u16) -> Option<PortHolder> {
    let connected = matches!(
        tokio::time::timeout(
            Duration::from_millis(500),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    );

    let pid = listener_pid(port);

    if !connected && pid.is_none() {
        return None;
    }

    let process_name = pid.and_then(process_name);
    Some(PortHolder { pid, process_name })
}

/// Resolve the name of a process from the system process table
pub fn process_name(pid: u32) -> Option<String> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(Pid::from_u32(pid))
        .map(|p| p.name().to_string_lossy().into_owned())
}

/// Find the PID listening on a local TCP port (Linux)
#[cfg(target_os = "linux")]
fn listener_pid(port: u16) -> Option<u32> {
    let inode = listening_socket_inode(port)?;
    pid_owning_inode(inode)
}

#[cfg(not(target_os = "linux"))]
fn listener_pid(_port: u16) -> Option<u32> {
    None
}

/// Scan /proc/net/tcp and /proc/net/tcp6 for a LISTEN (state 0A) socket
/// bound to the port, returning its inode
#[cfg(target_os = "linux")]
fn listening_socket_inode(port: u16) -> Option<u64> {
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            // local_address is hex "ADDR:PORT"
            let Some(local_port_hex) = fields[1].rsplit(':').next() else {
                continue;
            };
            let Ok(local_port) = u16::from_str_radix(local_port_hex, 16) else {
                continue;
            };
            if local_port != port || fields[3] != "0A" {
                continue;
            }
            if let Ok(inode) = fields[9].parse::<u64>() {
                debug!("Port {} held by socket inode {}", port, inode);
                return Some(inode);
            }
        }
    }
    None
}

/// Find which process has the socket inode open under /proc/<pid>/fd
#[cfg(target_os = "linux")]
fn pid_owning_inode(inode: u64) -> Option<u32> {
    let target = format!("socket:[{}]", inode);
    let proc_dir = std::fs::read_dir("/proc").ok()?;

    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fd_dir = match std::fs::read_dir(entry.path().join("fd")) {
            Ok(dir) => dir,
            Err(_) => continue, // not ours to inspect
        };
        for fd in fd_dir.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_free_port_has_no_holder() {
        // Bind then drop to get a port that was just free
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(find_listener(port).await.is_none());
    }

    #[tokio::test]
    async fn test_held_port_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let holder = find_listener(port).await.expect("port should be held");
        // On Linux we should be able to attribute our own listener
        #[cfg(target_os = "linux")]
        assert_eq!(holder.pid, Some(std::process::id()));
        #[cfg(not(target_os = "linux"))]
        let _ = holder;
    }

    #[test]
    fn test_describe_formats() {
        let full = PortHolder {
            pid: Some(4242),
            process_name: Some("postgres".to_string()),
        };
        assert_eq!(full.describe(), "pid 4242 (postgres)");

        let bare = PortHolder {
            pid: None,
            process_name: None,
        };
        assert_eq!(bare.describe(), "an unknown process");
    }
}
