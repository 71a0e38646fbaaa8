use super::*;
use crate::state::new_shared_state;
use std::collections::HashMap as StdHashMap;
use tempfile::TempDir;

/// Everything a supervisor test needs, with stub forwarder commands
struct Harness {
    supervisor: Arc<Supervisor>,
    state: SharedDaemonState,
    store_path: PathBuf,
    _dir: TempDir,
}

fn stub_builder(script: &'static str) -> CommandBuilder {
    Arc::new(move |_definition: &ResolvedService| {
        Ok(ForwardCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        })
    })
}

fn harness(script: &'static str) -> Harness {
    harness_with_builder(stub_builder(script))
}

fn harness_with_builder(builder: CommandBuilder) -> Harness {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("state.json");
    let state = new_shared_state();
    let (supervisor, events_rx) = Supervisor::new_with_builder(
        state.clone(),
        StateStore::new(store_path.clone()),
        Arc::new(TaskRegistry::new()),
        dir.path().join("logs"),
        builder,
    );
    tokio::spawn(Arc::clone(&supervisor).run_events(events_rx));
    Harness {
        supervisor,
        state,
        store_path,
        _dir: dir,
    }
}

fn config(yaml: &str) -> LocalportConfig {
    LocalportConfig::parse(yaml, std::path::Path::new("test.yaml"), &StdHashMap::new()).unwrap()
}

fn one_service_yaml(local_port: u16) -> String {
    format!(
        r#"
version: "1.0"
defaults:
  health_check:
    type: tcp
    interval: 1h
  restart_policy:
    max_attempts: 3
    initial_delay: 100ms
    max_delay: 100ms
services:
  - name: db
    technology: kubernetes
    local_port: {local_port}
    remote_port: 5432
    connection:
      resource_name: postgres
"#
    )
}

/// An ephemeral port that was just observed free
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn running_pid(harness: &Harness, name: &str) -> Option<u32> {
    let state = harness.state.read();
    let definition = state.definition_by_name(name)?;
    state.services.get(&definition.id).and_then(|r| r.pid)
}

fn service_row(
    harness: &Harness,
    name: &str,
) -> localport_protocol::protocol::ServiceStatusInfo {
    harness
        .supervisor
        .status()
        .services
        .into_iter()
        .find(|s| s.name == name)
        .expect("service should be in status")
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let end = tokio::time::Instant::now() + deadline;
    while !check() {
        if tokio::time::Instant::now() >= end {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_apply_config_starts_services() {
    let harness = harness("sleep 30");
    let port = free_port().await;

    let results = harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;
    assert!(results.iter().all(|r| r.success), "results: {results:?}");

    let pid = running_pid(&harness, "db").expect("db should have a pid");
    assert!(process_alive(pid));

    let row = service_row(&harness, "db");
    assert_eq!(row.state, "running");
    assert_eq!(row.health, "unknown"); // no probe has run yet

    // state.json has the entry with that pid
    let persisted = StateStore::new(harness.store_path.clone()).load();
    assert_eq!(persisted.forwards.len(), 1);
    assert_eq!(persisted.forwards[0].pid, pid);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;
    let pid = running_pid(&harness, "db").unwrap();

    let results = harness
        .supervisor
        .start_services(&ServiceSelector::Names(vec!["db".to_string()]))
        .await;
    assert!(results[0].success);
    assert_eq!(results[0].message.as_deref(), Some("already running"));
    assert_eq!(running_pid(&harness, "db"), Some(pid));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;
    let pid = running_pid(&harness, "db").unwrap();

    let selector = ServiceSelector::Names(vec!["db".to_string()]);
    let first = harness.supervisor.stop_services(&selector, false).await;
    assert!(first[0].success);
    assert!(first[0].message.is_none());
    assert!(!process_alive(pid));

    let second = harness.supervisor.stop_services(&selector, false).await;
    assert!(second[0].success);
    assert_eq!(second[0].message.as_deref(), Some("not running"));

    // Stopped service shows as a placeholder row, and state.json is empty
    let row = service_row(&harness, "db");
    assert_eq!(row.state, "stopped");
    assert!(StateStore::new(harness.store_path.clone()).load().forwards.is_empty());
}

#[tokio::test]
async fn test_unknown_service_reported() {
    let harness = harness("sleep 30");
    let results = harness
        .supervisor
        .start_services(&ServiceSelector::Names(vec!["ghost".to_string()]))
        .await;
    assert!(!results[0].success);
    assert_eq!(results[0].message.as_deref(), Some("service not found"));
}

#[tokio::test]
async fn test_reload_unchanged_config_is_noop() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    let yaml = one_service_yaml(port);

    harness.supervisor.apply_config(&config(&yaml)).await;
    let pid = running_pid(&harness, "db").unwrap();

    let results = harness.supervisor.apply_config(&config(&yaml)).await;
    assert!(results.is_empty(), "unexpected changes: {results:?}");
    assert_eq!(running_pid(&harness, "db"), Some(pid));
}

#[tokio::test]
async fn test_reload_tuning_change_keeps_pid() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;
    let pid = running_pid(&harness, "db").unwrap();

    // Same identity, different probe interval
    let tuned = one_service_yaml(port).replace("interval: 1h", "interval: 30m");
    let results = harness.supervisor.apply_config(&config(&tuned)).await;

    assert!(results
        .iter()
        .any(|r| r.message.as_deref() == Some("updated in place")));
    assert_eq!(running_pid(&harness, "db"), Some(pid));

    let state = harness.state.read();
    let definition = state.definition_by_name("db").unwrap();
    assert_eq!(definition.health_check.interval, Duration::from_secs(1800));
}

#[tokio::test]
async fn test_reload_identity_change_replaces_service() {
    let harness = harness("sleep 30");
    let old_port = free_port().await;
    let new_port = free_port().await;

    harness.supervisor.apply_config(&config(&one_service_yaml(old_port))).await;
    let old_pid = running_pid(&harness, "db").unwrap();
    let old_id = harness.state.read().definition_by_name("db").unwrap().id;

    harness.supervisor.apply_config(&config(&one_service_yaml(new_port))).await;

    let new_pid = running_pid(&harness, "db").unwrap();
    let new_id = harness.state.read().definition_by_name("db").unwrap().id;

    assert_ne!(old_id, new_id);
    assert_ne!(old_pid, new_pid);
    assert!(!process_alive(old_pid));
    assert!(process_alive(new_pid));

    let persisted = StateStore::new(harness.store_path.clone()).load();
    assert_eq!(persisted.forwards.len(), 1);
    assert_eq!(persisted.forwards[0].service_id, new_id);
}

#[tokio::test]
async fn test_external_port_conflict_refused() {
    let harness = harness("sleep 30");

    // Hold the port ourselves; the supervisor has no record of this pid
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let results = harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;

    let failure = results.iter().find(|r| !r.success).expect("should refuse");
    let message = failure.message.as_deref().unwrap();
    assert!(message.contains(&format!("Port {}", port)));
    #[cfg(target_os = "linux")]
    assert!(message.contains(&std::process::id().to_string()));

    // The foreign process was not signaled and nothing was persisted
    assert!(listener.local_addr().is_ok());
    assert!(StateStore::new(harness.store_path.clone()).load().forwards.is_empty());

    let row = service_row(&harness, "db");
    assert_eq!(row.state, "failed");
}

#[tokio::test]
async fn test_child_death_triggers_restart_with_new_pid() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;
    let first_pid = running_pid(&harness, "db").unwrap();

    // Scenario B: kill the forwarder out from under the supervisor
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).unwrap();
    }

    wait_for("service to restart with a new pid", Duration::from_secs(5), || {
        running_pid(&harness, "db").map(|pid| pid != first_pid).unwrap_or(false)
    })
    .await;

    let row = service_row(&harness, "db");
    assert_eq!(row.state, "running");
    assert_eq!(row.restart_attempts, 1);

    let new_pid = running_pid(&harness, "db").unwrap();
    assert!(process_alive(new_pid));
}

#[tokio::test]
async fn test_restart_gives_up_after_max_attempts() {
    // Scenario C: the forwarder dies instantly, policy allows 3 attempts
    let harness = harness("exit 1");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;

    wait_for("service to fail permanently", Duration::from_secs(10), || {
        service_row(&harness, "db").state == "failed"
    })
    .await;

    let row = service_row(&harness, "db");
    assert_eq!(row.restart_attempts, 3);

    // No further spawn attempts after give-up
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(service_row(&harness, "db").state, "failed");
    assert!(running_pid(&harness, "db").is_none());
}

#[tokio::test]
async fn test_adoption_after_daemon_restart() {
    let port = free_port().await;
    let yaml = one_service_yaml(port);

    let first = harness("sleep 30");
    first.supervisor.apply_config(&config(&yaml)).await;
    let pid = running_pid(&first, "db").unwrap();

    // "Restart" the daemon: new supervisor, same state file, same builder
    let store_path = first.store_path.clone();
    let state = new_shared_state();
    let dir = TempDir::new().unwrap();
    let (second, events_rx) = Supervisor::new_with_builder(
        state.clone(),
        StateStore::new(store_path),
        Arc::new(TaskRegistry::new()),
        dir.path().join("logs"),
        stub_builder("sleep 30"),
    );
    tokio::spawn(Arc::clone(&second).run_events(events_rx));

    let parsed = config(&yaml);
    {
        let (resolved, _) = parsed.resolve_services();
        state.write().definitions = resolved.into_iter().map(|d| (d.id, d)).collect();
    }
    second.adopt_persisted(&parsed);

    let record = {
        let state = state.read();
        let definition = state.definition_by_name("db").unwrap();
        state.services.get(&definition.id).cloned().unwrap()
    };
    assert!(record.adopted);
    assert_eq!(record.pid, Some(pid));
    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.health.verdict, HealthVerdict::Unknown);

    // The adopted child can be stopped through the new supervisor
    let results = second
        .stop_services(&ServiceSelector::Names(vec!["db".to_string()]), false)
        .await;
    assert!(results[0].success);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_adoption_rejects_fingerprint_mismatch() {
    let port = free_port().await;
    let yaml = one_service_yaml(port);

    let first = harness("sleep 30");
    first.supervisor.apply_config(&config(&yaml)).await;
    let pid = running_pid(&first, "db").unwrap();

    // New daemon whose configuration would spawn a different command
    let state = new_shared_state();
    let dir = TempDir::new().unwrap();
    let (second, events_rx) = Supervisor::new_with_builder(
        state.clone(),
        StateStore::new(first.store_path.clone()),
        Arc::new(TaskRegistry::new()),
        dir.path().join("logs"),
        stub_builder("sleep 60"),
    );
    tokio::spawn(Arc::clone(&second).run_events(events_rx));
    second.adopt_persisted(&config(&yaml));

    // Not adopted, not killed: the stranger keeps running
    assert!(state.read().services.is_empty());
    assert!(process_alive(pid));

    // Clean up the stray child
    adapters::force_kill_pid(pid);
}

#[tokio::test]
async fn test_unconfigured_persisted_entry_becomes_orphan() {
    let port = free_port().await;
    let yaml = one_service_yaml(port);

    let first = harness("sleep 30");
    first.supervisor.apply_config(&config(&yaml)).await;
    let pid = running_pid(&first, "db").unwrap();

    // New daemon with an empty configuration
    let empty = config("version: \"1.0\"\nservices: []\n");
    let state = new_shared_state();
    let dir = TempDir::new().unwrap();
    let (second, events_rx) = Supervisor::new_with_builder(
        state.clone(),
        StateStore::new(first.store_path.clone()),
        Arc::new(TaskRegistry::new()),
        dir.path().join("logs"),
        stub_builder("sleep 30"),
    );
    tokio::spawn(Arc::clone(&second).run_events(events_rx));
    second.adopt_persisted(&empty);

    let snapshot = second.status();
    assert!(snapshot.services.is_empty());
    assert_eq!(snapshot.orphans.len(), 1);
    assert_eq!(snapshot.orphans[0].pid, pid);
    assert!(process_alive(pid), "orphans are never killed implicitly");

    // Explicit cleanup terminates it
    let results = second.stop_services(&ServiceSelector::All, true).await;
    assert!(results.iter().any(|r| r.message.as_deref().map(|m| m.contains("cleaned up")).unwrap_or(false)));
    assert!(!process_alive(pid));
    assert!(second.status().orphans.is_empty());
}

#[tokio::test]
async fn test_dead_persisted_entry_discarded() {
    let port = free_port().await;
    let yaml = one_service_yaml(port);

    let first = harness("sleep 30");
    first.supervisor.apply_config(&config(&yaml)).await;
    let pid = running_pid(&first, "db").unwrap();
    first
        .supervisor
        .stop_services(&ServiceSelector::All, false)
        .await;
    assert!(!process_alive(pid));

    // Write a stale entry by hand (stop cleared the real one)
    let parsed = config(&yaml);
    let (resolved, _) = parsed.resolve_services();
    StateStore::new(first.store_path.clone())
        .save(vec![crate::persistence::PersistedForward {
            service_id: resolved[0].id,
            name: "db".to_string(),
            pid,
            technology: resolved[0].technology,
            local_port: port,
            started_at: Utc::now(),
            argv_fingerprint: "stale".to_string(),
        }])
        .unwrap();

    let state = new_shared_state();
    let dir = TempDir::new().unwrap();
    let (second, events_rx) = Supervisor::new_with_builder(
        state.clone(),
        StateStore::new(first.store_path.clone()),
        Arc::new(TaskRegistry::new()),
        dir.path().join("logs"),
        stub_builder("sleep 30"),
    );
    tokio::spawn(Arc::clone(&second).run_events(events_rx));
    second.adopt_persisted(&parsed);

    assert!(state.read().services.is_empty());
    assert!(state.read().orphans.is_empty());
}

#[tokio::test]
async fn test_draining_refuses_starts() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;
    harness.supervisor.stop_services(&ServiceSelector::All, false).await;

    harness.supervisor.set_draining();
    let results = harness
        .supervisor
        .start_services(&ServiceSelector::Names(vec!["db".to_string()]))
        .await;
    assert!(!results[0].success);
    assert!(results[0].message.as_deref().unwrap().contains("shutting down"));
}

#[tokio::test]
async fn test_stop_all_children_leaves_nothing() {
    let harness = harness("sleep 30");
    let port_a = free_port().await;
    let port_b = free_port().await;
    let yaml = format!(
        r#"
version: "1.0"
services:
  - name: db
    technology: kubernetes
    local_port: {port_a}
    remote_port: 5432
    connection: {{ resource_name: postgres }}
  - name: kafka
    technology: kubernetes
    local_port: {port_b}
    remote_port: 9092
    connection: {{ resource_name: kafka }}
"#
    );
    harness.supervisor.apply_config(&config(&yaml)).await;

    let pids: Vec<u32> = ["db", "kafka"]
        .iter()
        .filter_map(|name| running_pid(&harness, name))
        .collect();
    assert_eq!(pids.len(), 2);

    harness.supervisor.stop_all_children().await;

    for pid in pids {
        assert!(!process_alive(pid));
    }
    assert!(harness.supervisor.live_children().is_empty());
}

#[tokio::test]
async fn test_reconciler_tick_sweeps_dead_pids() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    let parsed = config(&one_service_yaml(port));
    let (resolved, _) = parsed.resolve_services();
    let definition = resolved[0].clone();

    // An adopted-style record has no waiter task, so only the sweep can
    // notice its child is gone. Use a PID that is already dead.
    let dead_pid = {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    };
    {
        let mut state = harness.state.write();
        state.definitions.insert(definition.id, definition.clone());
        let mut record = RunningService::new(definition.id);
        record.status = ServiceStatus::Running;
        record.begin_epoch(dead_pid, Utc::now());
        record.argv_fingerprint = Some("stale".to_string());
        record.adopted = true;
        state.services.insert(definition.id, record);
    }

    harness.supervisor.reconcile_tick();

    // The sweep routes the dead PID through the child-exit path; the
    // restart policy respawns with a fresh child
    wait_for("swept service to restart", Duration::from_secs(5), || {
        running_pid(&harness, "db")
            .map(|pid| pid != dead_pid && process_alive(pid))
            .unwrap_or(false)
    })
    .await;

    let row = service_row(&harness, "db");
    assert_eq!(row.state, "running");
    assert_eq!(row.restart_attempts, 1);
}

#[tokio::test]
async fn test_status_snapshot_shape() {
    let harness = harness("sleep 30");
    let port = free_port().await;
    harness.supervisor.apply_config(&config(&one_service_yaml(port))).await;

    let snapshot = harness.supervisor.status();
    assert_eq!(snapshot.daemon_pid, std::process::id());
    assert_eq!(snapshot.services.len(), 1);

    let row = &snapshot.services[0];
    assert_eq!(row.name, "db");
    assert_eq!(row.technology, "kubernetes");
    assert_eq!(row.local_port, port);
    assert_eq!(row.remote_port, 5432);
    assert!(row.log_path.is_some());
}
