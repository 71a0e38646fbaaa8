use super::*;
use crate::adapters::{process_alive, ForwardCommand};
use crate::config::{LocalportConfig, ResolvedService};
use crate::persistence::StateStore;
use crate::state::new_shared_state;
use crate::tasks::PRIORITY_HEALTH;
use localport_protocol::protocol::ServiceSelector;
use std::collections::HashMap;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    supervisor: Arc<Supervisor>,
    registry: Arc<TaskRegistry>,
    events_tx: mpsc::Sender<DaemonEvent>,
    events_rx: mpsc::Receiver<DaemonEvent>,
    server_rx: mpsc::Receiver<()>,
    server_tx: mpsc::Sender<()>,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(TaskRegistry::new());
    let state = new_shared_state();
    let (supervisor, supervisor_rx) = Supervisor::new_with_builder(
        state,
        StateStore::new(dir.path().join("state.json")),
        Arc::clone(&registry),
        dir.path().join("logs"),
        Arc::new(|_d: &ResolvedService| {
            Ok(ForwardCommand {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "sleep 30".to_string()],
                env: Vec::new(),
            })
        }),
    );
    tokio::spawn(Arc::clone(&supervisor).run_events(supervisor_rx));

    let (events_tx, events_rx) = mpsc::channel(8);
    let (server_tx, server_rx) = mpsc::channel(1);

    Fixture {
        supervisor,
        registry,
        events_tx,
        events_rx,
        server_rx,
        server_tx,
        _dir: dir,
    }
}

fn fast_budgets() -> PhaseBudgets {
    PhaseBudgets {
        quiesce: Duration::from_millis(200),
        drain: Duration::from_millis(500),
        cancel: Duration::from_secs(5),
        force: Duration::from_secs(2),
    }
}

async fn start_db(fixture: &Fixture) -> u32 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let yaml = format!(
        r#"
version: "1.0"
services:
  - name: db
    technology: kubernetes
    local_port: {port}
    remote_port: 5432
    connection: {{ resource_name: postgres }}
"#
    );
    let config =
        LocalportConfig::parse(&yaml, std::path::Path::new("test.yaml"), &HashMap::new()).unwrap();
    fixture.supervisor.apply_config(&config).await;

    fixture
        .supervisor
        .status()
        .services
        .first()
        .and_then(|s| s.pid)
        .expect("db should be running")
}

#[tokio::test]
async fn test_clean_shutdown_with_running_services() {
    let mut fixture = fixture();
    let pid = start_db(&fixture).await;
    assert!(process_alive(pid));

    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&fixture.supervisor),
        Arc::clone(&fixture.registry),
        fixture.server_tx.clone(),
        fast_budgets(),
    );

    let outcome = coordinator.run(&mut fixture.events_rx).await;

    assert_eq!(outcome, ShutdownOutcome::Clean);
    assert!(!process_alive(pid), "no child pids may remain");
    assert!(fixture.registry.is_empty());
    // Quiesce asked the control server to stop accepting
    assert!(fixture.server_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_shutdown_with_no_services_is_clean_and_fast() {
    let mut fixture = fixture();
    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&fixture.supervisor),
        Arc::clone(&fixture.registry),
        fixture.server_tx.clone(),
        fast_budgets(),
    );

    let started = tokio::time::Instant::now();
    let outcome = coordinator.run(&mut fixture.events_rx).await;

    assert_eq!(outcome, ShutdownOutcome::Clean);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_draining_starts_refused_after_shutdown_begins() {
    let mut fixture = fixture();
    start_db(&fixture).await;

    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&fixture.supervisor),
        Arc::clone(&fixture.registry),
        fixture.server_tx.clone(),
        fast_budgets(),
    );
    coordinator.run(&mut fixture.events_rx).await;

    let results = fixture
        .supervisor
        .start_services(&ServiceSelector::All)
        .await;
    assert!(results.iter().all(|r| !r.success));
}

#[tokio::test]
async fn test_emergency_signal_jumps_to_force() {
    let mut fixture = fixture();
    let pid = start_db(&fixture).await;

    // Hold the drain phase open with synthetic in-flight work and a huge
    // drain budget; only the emergency signal can end it early
    let activity = fixture.registry.activity();
    let _guard = activity.begin();
    let budgets = PhaseBudgets {
        quiesce: Duration::from_millis(100),
        drain: Duration::from_secs(3600),
        cancel: Duration::from_secs(3600),
        force: Duration::from_secs(2),
    };

    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&fixture.supervisor),
        Arc::clone(&fixture.registry),
        fixture.server_tx.clone(),
        budgets,
    );

    fixture
        .events_tx
        .send(DaemonEvent::EmergencyShutdown)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = coordinator.run(&mut fixture.events_rx).await;

    assert_eq!(outcome, ShutdownOutcome::Escalated);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!process_alive(pid), "force phase must kill survivors");
}

#[tokio::test]
async fn test_stuck_task_is_abandoned_not_waited_for() {
    let mut fixture = fixture();

    let token = CancellationToken::new();
    fixture.registry.register(
        "stuck-loop",
        PRIORITY_HEALTH,
        Vec::new(),
        token,
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }),
    );

    let budgets = PhaseBudgets {
        quiesce: Duration::from_millis(100),
        drain: Duration::from_millis(200),
        cancel: Duration::from_secs(1),
        force: Duration::from_secs(1),
    };
    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&fixture.supervisor),
        Arc::clone(&fixture.registry),
        fixture.server_tx.clone(),
        budgets,
    );

    let started = tokio::time::Instant::now();
    coordinator.run(&mut fixture.events_rx).await;
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_default_budgets_sum_to_thirty_seconds() {
    let budgets = PhaseBudgets::default();
    let total = budgets.quiesce + budgets.drain + budgets.cancel + budgets.force;
    assert_eq!(total, Duration::from_secs(30));
}
