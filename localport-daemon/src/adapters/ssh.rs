//! ssh tunnel adapter

use crate::config::{ResolvedService, SshConnection};
use crate::errors::{DaemonError, Result};

use super::{find_binary, ForwardCommand};

const SSH: &str = "ssh";
const SSHPASS: &str = "sshpass";

/// Build `ssh -N -L <local>:localhost:<remote> [user@]host` with strict
/// host-key checking, a short connect timeout, and ExitOnForwardFailure so
/// a failed remote bind kills the process instead of leaving a half-dead
/// tunnel.
///
/// Password auth (discouraged) goes through `sshpass -e`: the password is
/// read from the environment variable named in the config and handed to
/// the child as SSHPASS. It never appears in argv.
pub fn command(service: &ResolvedService, conn: &SshConnection) -> Result<ForwardCommand> {
    if find_binary(SSH).is_none() {
        return Err(DaemonError::ForwarderMissing {
            service: service.name.clone(),
            binary: SSH.to_string(),
        });
    }

    let args = build_args(service, conn);

    match conn.password_env {
        Some(ref password_env) => {
            if find_binary(SSHPASS).is_none() {
                return Err(DaemonError::ForwarderMissing {
                    service: service.name.clone(),
                    binary: SSHPASS.to_string(),
                });
            }
            let password = std::env::var(password_env).map_err(|_| {
                DaemonError::Config(format!(
                    "service {}: password environment variable {} is not set",
                    service.name, password_env
                ))
            })?;

            let mut wrapped = vec!["-e".to_string(), SSH.to_string()];
            wrapped.extend(args);
            Ok(ForwardCommand {
                program: SSHPASS.to_string(),
                args: wrapped,
                env: vec![("SSHPASS".to_string(), password)],
            })
        }
        None => Ok(ForwardCommand {
            program: SSH.to_string(),
            args,
            env: Vec::new(),
        }),
    }
}

pub(crate) fn build_args(service: &ResolvedService, conn: &SshConnection) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-L".to_string(),
        format!("{}:localhost:{}", service.local_port, service.remote_port),
        "-o".to_string(),
        "StrictHostKeyChecking=yes".to_string(),
        "-o".to_string(),
        "ConnectTimeout=10".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
    ];

    if conn.port != 22 {
        args.push("-p".to_string());
        args.push(conn.port.to_string());
    }

    if let Some(ref key_file) = conn.key_file {
        args.push("-i".to_string());
        args.push(key_file.to_string_lossy().into_owned());
    }

    let destination = match conn.user {
        Some(ref user) => format!("{}@{}", user, conn.host),
        None => conn.host.clone(),
    };
    args.push(destination);

    args
}
