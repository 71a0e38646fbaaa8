use super::*;
use crate::config::Connection;
use crate::test_support::test_definition;

#[test]
fn test_status_live_states() {
    assert!(ServiceStatus::Starting.is_live());
    assert!(ServiceStatus::Running.is_live());
    assert!(ServiceStatus::Unhealthy.is_live());
    assert!(ServiceStatus::Restarting.is_live());
    assert!(!ServiceStatus::Stopping.is_live());
    assert!(!ServiceStatus::Stopped.is_live());
    assert!(!ServiceStatus::Failed.is_live());
}

#[test]
fn test_status_terminal_states() {
    assert!(ServiceStatus::Stopped.is_terminal());
    assert!(ServiceStatus::Failed.is_terminal());
    assert!(!ServiceStatus::Restarting.is_terminal());
}

#[test]
fn test_begin_epoch_resets_counters() {
    let definition = test_definition("db", 5432);
    let mut record = RunningService::new(definition.id);
    record.consecutive_failures = 2;
    record.consecutive_successes = 7;
    record.health.verdict = HealthVerdict::Unhealthy;
    record.next_retry_at = Some(Utc::now());

    record.begin_epoch(4242, Utc::now());

    assert_eq!(record.pid, Some(4242));
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.consecutive_successes, 0);
    assert_eq!(record.health.verdict, HealthVerdict::Unknown);
    assert!(record.next_retry_at.is_none());
}

#[test]
fn test_begin_epoch_preserves_restart_attempt() {
    // The attempt counter spans epochs; only the restart manager resets it
    let definition = test_definition("db", 5432);
    let mut record = RunningService::new(definition.id);
    record.restart_attempt = 3;
    record.begin_epoch(4242, Utc::now());
    assert_eq!(record.restart_attempt, 3);
}

#[test]
fn test_status_info_separates_state_and_health() {
    let definition = test_definition("db", 5432);
    let mut record = RunningService::new(definition.id);
    record.status = ServiceStatus::Running;
    record.health.verdict = HealthVerdict::Unhealthy;

    let info = record.to_status_info(&definition);
    assert_eq!(info.state, "running");
    assert_eq!(info.health, "unhealthy");
}

#[test]
fn test_cluster_unhealthy_lookup() {
    let mut state = DaemonState::new();
    let mut definition = test_definition("db", 5432);
    if let Connection::Kubernetes(ref mut k) = definition.connection {
        k.context = Some("minikube".to_string());
    }

    assert!(!state.cluster_unhealthy_for(&definition));

    state.cluster_health.insert(
        "minikube".to_string(),
        ClusterStatus {
            healthy: false,
            last_checked: Utc::now(),
            detail: Some("cluster-info failed".to_string()),
        },
    );
    assert!(state.cluster_unhealthy_for(&definition));

    state.cluster_health.get_mut("minikube").unwrap().healthy = true;
    assert!(!state.cluster_unhealthy_for(&definition));
}
