//! kubectl port-forward adapter

use crate::config::{KubernetesConnection, ResolvedService};
use crate::errors::{DaemonError, Result};

use super::{find_binary, ForwardCommand};

const KUBECTL: &str = "kubectl";

/// Build `kubectl port-forward <kind>/<name> <local>:<remote>` with
/// namespace and optional context flags.
///
/// A missing kubectl binary is a configuration error, not a transient
/// failure; retrying will not install it.
pub fn command(service: &ResolvedService, conn: &KubernetesConnection) -> Result<ForwardCommand> {
    if find_binary(KUBECTL).is_none() {
        return Err(DaemonError::ForwarderMissing {
            service: service.name.clone(),
            binary: KUBECTL.to_string(),
        });
    }

    Ok(ForwardCommand {
        program: KUBECTL.to_string(),
        args: build_args(service, conn),
        env: Vec::new(),
    })
}

pub(crate) fn build_args(service: &ResolvedService, conn: &KubernetesConnection) -> Vec<String> {
    let mut args = vec![
        "port-forward".to_string(),
        format!("{}/{}", conn.resource_type, conn.resource_name),
        format!("{}:{}", service.local_port, service.remote_port),
        "--namespace".to_string(),
        conn.namespace.clone(),
    ];

    if let Some(ref context) = conn.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }

    args
}
