//! Pluggable health probes
//!
//! Each probe asks whether the tunnel actually carries
//! traffic, against the local end of the forward. Every probe runs under
//! a hard deadline and a cancellation token; a stuck probe can never block
//! the scheduler or shutdown.

mod cluster;
mod http;
mod kafka;
mod postgres;
mod tcp;

pub use cluster::run_cluster_monitor;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ProbeKind, ResolvedService};
use crate::state::HealthVerdict;

/// Result of one probe execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
    /// The scheduler is being torn down; the result must not be counted
    Cancelled,
}

/// Run the configured probe for a service once, honoring its timeout and
/// the cancellation token.
pub async fn run_probe(service: &ResolvedService, token: &CancellationToken) -> ProbeOutcome {
    let spec = &service.health_check;
    let deadline = spec.timeout;

    let check = async {
        match spec.kind {
            ProbeKind::Tcp => tcp::check(service.local_port).await,
            ProbeKind::Http => http::check(&spec.config, service.local_port, deadline).await,
            ProbeKind::Kafka => kafka::check(&spec.config, service.local_port).await,
            ProbeKind::Postgres => postgres::check(&spec.config, service.local_port).await,
        }
    };

    tokio::select! {
        _ = token.cancelled() => ProbeOutcome::Cancelled,
        result = tokio::time::timeout(deadline, check) => match result {
            Ok(Ok(())) => ProbeOutcome::Healthy,
            Ok(Err(reason)) => {
                debug!(
                    "Probe {} failed for {}: {}",
                    spec.kind.as_str(), service.name, reason
                );
                ProbeOutcome::Unhealthy(reason)
            }
            Err(_) => ProbeOutcome::Unhealthy(format!(
                "{} probe timed out after {:?}",
                spec.kind.as_str(), deadline
            )),
        },
    }
}

/// Compose the local probe verdict with the service's cluster poller.
///
/// Policy: unhealthy if EITHER side is unhealthy; healthy only when the
/// local probe says so and the cluster does not object; unknown otherwise.
/// A failing cluster can mask nothing: it marks even a locally-healthy
/// service unhealthy, because the listening socket staying open is exactly
/// the failure mode cluster polling exists to catch.
pub fn compose(local: HealthVerdict, cluster_unhealthy: bool) -> HealthVerdict {
    if cluster_unhealthy {
        return HealthVerdict::Unhealthy;
    }
    local
}

#[cfg(test)]
mod tests;
