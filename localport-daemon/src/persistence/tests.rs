use super::*;
use crate::config::{Connection, KubernetesConnection};
use tempfile::TempDir;

fn forward(name: &str, pid: u32, local_port: u16) -> PersistedForward {
    let connection = Connection::Kubernetes(KubernetesConnection {
        resource_type: "service".to_string(),
        resource_name: name.to_string(),
        namespace: "default".to_string(),
        context: None,
    });
    PersistedForward {
        service_id: ServiceId::derive(name, Technology::Kubernetes, local_port, local_port, &connection),
        name: name.to_string(),
        pid,
        technology: Technology::Kubernetes,
        local_port,
        started_at: Utc::now(),
        argv_fingerprint: "deadbeef".to_string(),
    }
}

#[test]
fn test_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    store
        .save(vec![forward("db", 100, 5432), forward("kafka", 101, 9092)])
        .unwrap();

    let loaded = store.load();
    assert_eq!(loaded.forwards.len(), 2);
    assert_eq!(loaded.forwards[0].name, "db");
    assert_eq!(loaded.forwards[0].pid, 100);
    assert_eq!(loaded.forwards[1].local_port, 9092);
}

#[test]
fn test_missing_file_is_empty_state() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    assert!(store.load().forwards.is_empty());
}

#[test]
fn test_corrupt_file_is_empty_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{not json").unwrap();

    let store = StateStore::new(path);
    assert!(store.load().forwards.is_empty());
}

#[test]
fn test_save_replaces_whole_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    store.save(vec![forward("db", 100, 5432)]).unwrap();
    store.save(vec![forward("kafka", 101, 9092)]).unwrap();

    let loaded = store.load();
    assert_eq!(loaded.forwards.len(), 1);
    assert_eq!(loaded.forwards[0].name, "kafka");
}

#[test]
fn test_save_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("nested").join("state.json"));
    store.save(vec![]).unwrap();
    assert!(store.path().exists());
}

#[cfg(unix)]
#[test]
fn test_state_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    store.save(vec![forward("db", 100, 5432)]).unwrap();

    let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
