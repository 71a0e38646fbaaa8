//! Out-of-band cluster health polling (kubernetes contexts)
//!
//! A port-forward can keep its local socket open long after the cluster
//! behind it has stopped answering. One poller per kubernetes context runs
//! `kubectl cluster-info` (and optionally pod/node listings) on an
//! interval and records the verdict in shared state; the health monitor
//! composes that verdict with each service's local probe.

use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterHealthConfig;
use crate::state::{ClusterStatus, SharedDaemonState};

/// Poll one kubernetes context until cancelled
pub async fn run_cluster_monitor(
    context: String,
    config: ClusterHealthConfig,
    state: SharedDaemonState,
    token: CancellationToken,
) {
    info!(
        "Cluster monitor for context {} started (interval {:?})",
        context, config.interval
    );

    loop {
        let verdict = check_context(&context, &config, &token).await;

        let healthy = match verdict {
            ContextVerdict::Healthy => true,
            ContextVerdict::Unhealthy(ref reason) => {
                warn!("Cluster context {} unhealthy: {}", context, reason);
                false
            }
            ContextVerdict::Cancelled => break,
        };

        {
            let mut state = state.write();
            let previous = state.cluster_health.get(&context).map(|s| s.healthy);
            if previous == Some(healthy) {
                if let Some(entry) = state.cluster_health.get_mut(&context) {
                    entry.last_checked = Utc::now();
                }
            } else {
                info!(
                    "Cluster context {} transitioned to {}",
                    context,
                    if healthy { "healthy" } else { "unhealthy" }
                );
                state.cluster_health.insert(
                    context.clone(),
                    ClusterStatus {
                        healthy,
                        last_checked: Utc::now(),
                        detail: match verdict {
                            ContextVerdict::Unhealthy(reason) => Some(reason),
                            _ => None,
                        },
                    },
                );
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    debug!("Cluster monitor for context {} exiting", context);
}

enum ContextVerdict {
    Healthy,
    Unhealthy(String),
    Cancelled,
}

async fn check_context(
    context: &str,
    config: &ClusterHealthConfig,
    token: &CancellationToken,
) -> ContextVerdict {
    let mut commands: Vec<Vec<&str>> = Vec::new();
    if config.commands.cluster_info {
        commands.push(vec!["cluster-info"]);
    }
    if config.commands.pod_status {
        commands.push(vec!["get", "pods", "--all-namespaces", "--no-headers"]);
    }
    if config.commands.node_status {
        commands.push(vec!["get", "nodes", "--no-headers"]);
    }

    for args in commands {
        match run_kubectl(context, &args, config.timeout, token).await {
            KubectlResult::Ok => {}
            KubectlResult::Failed(reason) => {
                if config.commands.events_on_failure {
                    let _ = run_kubectl(
                        context,
                        &["get", "events", "--sort-by=.lastTimestamp"],
                        config.timeout,
                        token,
                    )
                    .await;
                }
                return ContextVerdict::Unhealthy(reason);
            }
            KubectlResult::Cancelled => return ContextVerdict::Cancelled,
        }
    }

    ContextVerdict::Healthy
}

enum KubectlResult {
    Ok,
    Failed(String),
    Cancelled,
}

async fn run_kubectl(
    context: &str,
    args: &[&str],
    timeout: Duration,
    token: &CancellationToken,
) -> KubectlResult {
    let mut command = Command::new("kubectl");
    command
        .args(args)
        .arg("--context")
        .arg(context)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return KubectlResult::Failed(format!("kubectl spawn failed: {}", e)),
    };

    tokio::select! {
        _ = token.cancelled() => {
            let _ = child.kill().await;
            KubectlResult::Cancelled
        }
        result = tokio::time::timeout(timeout, child.wait()) => match result {
            Ok(Ok(status)) if status.success() => KubectlResult::Ok,
            Ok(Ok(status)) => KubectlResult::Failed(format!(
                "kubectl {} exited with {}",
                args.join(" "),
                status
            )),
            Ok(Err(e)) => KubectlResult::Failed(format!("kubectl wait failed: {}", e)),
            Err(_) => {
                let _ = child.kill().await;
                KubectlResult::Failed(format!(
                    "kubectl {} timed out after {:?}",
                    args.join(" "),
                    timeout
                ))
            }
        },
    }
}
