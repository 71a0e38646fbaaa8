use super::*;
use crate::config::{
    HealthCheckConfig, KubernetesConnection, ResolvedService, RestartPolicy, SshConnection,
    Technology,
};
use crate::service_log::ServiceLog;
use std::time::Duration;
use tempfile::TempDir;

fn kubernetes_service(context: Option<&str>) -> (ResolvedService, KubernetesConnection) {
    let conn = KubernetesConnection {
        resource_type: "service".to_string(),
        resource_name: "postgres".to_string(),
        namespace: "default".to_string(),
        context: context.map(|s| s.to_string()),
    };
    let connection = Connection::Kubernetes(conn.clone());
    let id = ServiceId::derive("db", Technology::Kubernetes, 5432, 5432, &connection);
    let service = ResolvedService {
        id,
        name: "db".to_string(),
        technology: Technology::Kubernetes,
        local_port: 5432,
        remote_port: 5432,
        connection,
        enabled: true,
        tags: Vec::new(),
        description: None,
        health_check: HealthCheckConfig::default(),
        restart_policy: RestartPolicy::default(),
        stop_grace_period: Duration::from_secs(5),
    };
    (service, conn)
}

fn ssh_service(conn: SshConnection) -> ResolvedService {
    let connection = Connection::Ssh(conn);
    let id = ServiceId::derive("tunnel", Technology::Ssh, 8080, 80, &connection);
    ResolvedService {
        id,
        name: "tunnel".to_string(),
        technology: Technology::Ssh,
        local_port: 8080,
        remote_port: 80,
        connection,
        enabled: true,
        tags: Vec::new(),
        description: None,
        health_check: HealthCheckConfig::default(),
        restart_policy: RestartPolicy::default(),
        stop_grace_period: Duration::from_secs(5),
    }
}

#[test]
fn test_kubectl_args_basic() {
    let (service, conn) = kubernetes_service(None);
    let args = super::kubectl::build_args(&service, &conn);
    assert_eq!(
        args,
        vec![
            "port-forward",
            "service/postgres",
            "5432:5432",
            "--namespace",
            "default",
        ]
    );
}

#[test]
fn test_kubectl_args_with_context() {
    let (service, conn) = kubernetes_service(Some("minikube"));
    let args = super::kubectl::build_args(&service, &conn);
    assert!(args.windows(2).any(|w| w == ["--context", "minikube"]));
}

#[test]
fn test_ssh_args_shape() {
    let conn = SshConnection {
        host: "bastion.example.com".to_string(),
        user: Some("deploy".to_string()),
        port: 2222,
        key_file: Some("/home/deploy/.ssh/id_ed25519".into()),
        password_env: None,
    };
    let service = ssh_service(conn.clone());
    let args = super::ssh::build_args(&service, &conn);

    assert_eq!(args[0], "-N");
    assert!(args.windows(2).any(|w| w == ["-L", "8080:localhost:80"]));
    assert!(args
        .windows(2)
        .any(|w| w == ["-o", "StrictHostKeyChecking=yes"]));
    assert!(args
        .windows(2)
        .any(|w| w == ["-o", "ExitOnForwardFailure=yes"]));
    assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
    assert!(args
        .windows(2)
        .any(|w| w == ["-i", "/home/deploy/.ssh/id_ed25519"]));
    assert_eq!(args.last().unwrap(), "deploy@bastion.example.com");
}

#[test]
fn test_ssh_default_port_omitted() {
    let conn = SshConnection {
        host: "bastion".to_string(),
        user: None,
        port: 22,
        key_file: None,
        password_env: None,
    };
    let service = ssh_service(conn.clone());
    let args = super::ssh::build_args(&service, &conn);
    assert!(!args.iter().any(|a| a == "-p"));
    assert_eq!(args.last().unwrap(), "bastion");
}

#[test]
fn test_fingerprint_is_stable() {
    let command = ForwardCommand {
        program: "kubectl".to_string(),
        args: vec!["port-forward".to_string(), "service/postgres".to_string()],
        env: Vec::new(),
    };
    assert_eq!(command.fingerprint(), command.fingerprint());
    assert_eq!(command.fingerprint().len(), 64);
}

#[test]
fn test_fingerprint_changes_with_args() {
    let a = ForwardCommand {
        program: "kubectl".to_string(),
        args: vec!["port-forward".to_string(), "5432:5432".to_string()],
        env: Vec::new(),
    };
    let mut b = a.clone();
    b.args[1] = "5433:5432".to_string();
    assert_ne!(a.fingerprint(), b.fingerprint());
}

#[test]
fn test_fingerprint_excludes_env() {
    let plain = ForwardCommand {
        program: "sshpass".to_string(),
        args: vec!["-e".to_string(), "ssh".to_string()],
        env: Vec::new(),
    };
    let with_secret = ForwardCommand {
        env: vec![("SSHPASS".to_string(), "hunter2".to_string())],
        ..plain.clone()
    };
    assert_eq!(plain.fingerprint(), with_secret.fingerprint());
}

#[test]
fn test_find_binary_locates_sh() {
    assert!(find_binary("sh").is_some());
    assert!(find_binary("definitely-not-a-real-binary-4242").is_none());
}

fn stub_command(script: &str) -> ForwardCommand {
    ForwardCommand {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: Vec::new(),
    }
}

#[tokio::test]
async fn test_spawn_reports_natural_exit() {
    let dir = TempDir::new().unwrap();
    let (service, _) = kubernetes_service(None);
    let log = ServiceLog::new(dir.path(), &service.name, &service.id);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(4);

    let spawned = spawn_forward(&service, &stub_command("exit 3"), &log, exit_tx).unwrap();
    assert!(spawned.pid > 0);

    let exit = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
        .await
        .expect("exit event should arrive")
        .expect("channel open");
    assert_eq!(exit.id, service.id);
    assert_eq!(exit.exit_code, Some(3));
    assert_eq!(exit.epoch, spawned.started_at);
}

#[tokio::test]
async fn test_stop_suppresses_exit_event() {
    let dir = TempDir::new().unwrap();
    let (service, _) = kubernetes_service(None);
    let log = ServiceLog::new(dir.path(), &service.name, &service.id);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(4);

    let spawned = spawn_forward(&service, &stub_command("sleep 30"), &log, exit_tx).unwrap();
    let pid = spawned.pid;
    assert!(process_alive(pid));

    spawned.stop_tx.send(Duration::from_secs(2)).unwrap();

    // The child dies and no ForwardExit arrives (the monitor drops its
    // sender without sending, closing the channel)
    match tokio::time::timeout(Duration::from_secs(5), exit_rx.recv()).await {
        Ok(None) | Err(_) => {}
        Ok(Some(exit)) => panic!("requested stop must not produce an exit event: {exit:?}"),
    }
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_spawn_writes_epoch_header() {
    let dir = TempDir::new().unwrap();
    let (service, _) = kubernetes_service(None);
    let log = ServiceLog::new(dir.path(), &service.name, &service.id);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(4);

    let spawned = spawn_forward(&service, &stub_command("exit 0"), &log, exit_tx).unwrap();
    let _ = exit_rx.recv().await;

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.contains(&format!("# pid: {}", spawned.pid)));
    assert!(content.contains("# service: db"));
}

#[tokio::test]
async fn test_child_output_lands_in_log_file() {
    let dir = TempDir::new().unwrap();
    let (service, _) = kubernetes_service(None);
    let log = ServiceLog::new(dir.path(), &service.name, &service.id);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(4);

    spawn_forward(
        &service,
        &stub_command("echo forwarding started; echo oops >&2"),
        &log,
        exit_tx,
    )
    .unwrap();
    let _ = exit_rx.recv().await;

    let content = std::fs::read_to_string(log.path()).unwrap();
    assert!(content.contains("forwarding started"));
    assert!(content.contains("oops"));
}

#[tokio::test]
async fn test_terminate_pid_kills_process() {
    let dir = TempDir::new().unwrap();
    let (service, _) = kubernetes_service(None);
    let log = ServiceLog::new(dir.path(), &service.name, &service.id);
    let (exit_tx, _exit_rx) = tokio::sync::mpsc::channel(4);

    let spawned = spawn_forward(&service, &stub_command("sleep 30"), &log, exit_tx).unwrap();
    assert!(terminate_pid(spawned.pid, Duration::from_secs(2)).await);
    assert!(!process_alive(spawned.pid));
}

#[tokio::test]
async fn test_terminate_already_dead_pid_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (service, _) = kubernetes_service(None);
    let log = ServiceLog::new(dir.path(), &service.name, &service.id);
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(4);

    let spawned = spawn_forward(&service, &stub_command("exit 0"), &log, exit_tx).unwrap();
    let _ = exit_rx.recv().await; // child reaped

    assert!(terminate_pid(spawned.pid, Duration::from_millis(100)).await);
}
