use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use localport_daemon::config::LocalportConfig;
use localport_daemon::errors::DaemonError;
use localport_daemon::persistence::StateStore;
use localport_daemon::service_log::{
    sweep_rotated_logs, DEFAULT_MAX_ROTATIONS, DEFAULT_RETENTION,
};
use localport_daemon::shutdown::{PhaseBudgets, ShutdownCoordinator, ShutdownOutcome};
use localport_daemon::signals::{spawn_signal_bridge, DaemonEvent};
use localport_daemon::state::new_shared_state;
use localport_daemon::supervisor::Supervisor;
use localport_daemon::tasks::{TaskRegistry, PRIORITY_MAINTENANCE};
use localport_daemon::Daemon;
use localport_protocol::protocol::{Request, Response, ResponseData};
use localport_protocol::server::Server;

const CONFIG_PATH_ENV: &str = "LOCALPORT_CONFIG";

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_STARTUP_IO_ERROR: u8 = 2;
const EXIT_SHUTDOWN_ESCALATED: u8 = 3;

fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| Daemon::default_config_path())
}

#[tokio::main]
async fn main() -> ExitCode {
    let data_dir = Daemon::data_dir();
    let logs_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("localportd: cannot create {}: {}", logs_dir.display(), e);
        return ExitCode::from(EXIT_STARTUP_IO_ERROR);
    }

    // Daemon log goes to a file; stderr stays quiet for the launcher
    let daemon_log = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(Daemon::daemon_log_path())
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!(
                "localportd: cannot open {}: {}",
                Daemon::daemon_log_path().display(),
                e
            );
            return ExitCode::from(EXIT_STARTUP_IO_ERROR);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(Arc::new(daemon_log))
        .with_ansi(false)
        .init();

    info!("Starting localportd {}", localport_daemon::VERSION);

    let pid_file = Daemon::pid_file();
    if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
        error!("Cannot write pid file {:?}: {}", pid_file, e);
        return ExitCode::from(EXIT_STARTUP_IO_ERROR);
    }

    // Configuration must be loadable before anything spawns
    let config_path = config_path();
    let config = match LocalportConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("localportd: {}", e);
            let _ = std::fs::remove_file(&pid_file);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let state = new_shared_state();
    let registry = Arc::new(TaskRegistry::new());
    let (supervisor, supervisor_rx) = Supervisor::new(
        state,
        StateStore::new(Daemon::state_file()),
        Arc::clone(&registry),
        Daemon::service_logs_dir(),
    );
    tokio::spawn(Arc::clone(&supervisor).run_events(supervisor_rx));

    // Reconcile what a previous daemon left behind, then bring up the
    // configured fleet
    supervisor.adopt_persisted(&config);
    supervisor.start_adopted_monitors();
    let results = supervisor.apply_config(&config).await;
    for result in results.iter().filter(|r| !r.success) {
        warn!(
            "Service {} did not start: {}",
            result.service,
            result.message.as_deref().unwrap_or("unknown error")
        );
    }

    spawn_log_sweeper(&registry);
    spawn_reconciler(&registry, &supervisor);

    // Signal bridge and control server feed the daemon loop
    let (daemon_tx, mut daemon_rx) = mpsc::channel::<DaemonEvent>(16);
    spawn_signal_bridge(daemon_tx.clone());

    let handler_supervisor = Arc::clone(&supervisor);
    let handler_daemon_tx = daemon_tx.clone();
    let handler_config_path = config_path.clone();
    let handler = move |request: Request, _shutdown: mpsc::Sender<()>| {
        let supervisor = Arc::clone(&handler_supervisor);
        let daemon_tx = handler_daemon_tx.clone();
        let config_path = handler_config_path.clone();
        async move { handle_request(request, supervisor, daemon_tx, config_path).await }
    };

    let socket_path = Daemon::socket_path();
    let server = match Server::new(socket_path.clone(), handler) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot create control server: {}", e);
            let _ = std::fs::remove_file(&pid_file);
            return ExitCode::from(EXIT_STARTUP_IO_ERROR);
        }
    };
    let server_shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Control server failed: {}", e);
        }
    });
    info!("Control socket at {:?}", socket_path);

    // Daemon loop: reloads and shutdown
    let outcome = loop {
        match daemon_rx.recv().await {
            Some(DaemonEvent::ReloadRequested) => {
                reload(&supervisor, &config_path).await;
            }
            Some(DaemonEvent::ShutdownRequested) | Some(DaemonEvent::EmergencyShutdown) => {
                let coordinator = ShutdownCoordinator::new(
                    Arc::clone(&supervisor),
                    Arc::clone(&registry),
                    server_shutdown.clone(),
                    PhaseBudgets::default(),
                );
                break coordinator.run(&mut daemon_rx).await;
            }
            None => break ShutdownOutcome::Clean,
        }
    };

    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_file);

    match outcome {
        ShutdownOutcome::Clean => {
            info!("localportd exited cleanly");
            ExitCode::SUCCESS
        }
        ShutdownOutcome::Escalated => {
            warn!("localportd exited via shutdown escalation");
            ExitCode::from(EXIT_SHUTDOWN_ESCALATED)
        }
    }
}

async fn handle_request(
    request: Request,
    supervisor: Arc<Supervisor>,
    daemon_tx: mpsc::Sender<DaemonEvent>,
    config_path: PathBuf,
) -> Response {
    match request {
        Request::Start { selector } => Response::ok(ResponseData::Operation {
            results: supervisor.start_services(&selector).await,
        }),
        Request::Stop { selector, orphans } => Response::ok(ResponseData::Operation {
            results: supervisor.stop_services(&selector, orphans).await,
        }),
        Request::Status => Response::ok(ResponseData::Status(supervisor.status())),
        Request::Reload => match LocalportConfig::load(&config_path) {
            Ok(config) => Response::ok(ResponseData::Operation {
                results: supervisor.apply_config(&config).await,
            }),
            Err(e) => Response::error(format!("reload failed: {}", e)),
        },
        Request::Logs { service } => match supervisor.log_path(&service) {
            Ok(path) => Response::ok(ResponseData::LogPath { service, path }),
            Err(DaemonError::ServiceNotFound(name)) => {
                Response::error(format!("service not found: {}", name))
            }
            Err(e) => Response::error(e.to_string()),
        },
        Request::DaemonStop => {
            // The response goes out before the daemon loop tears the
            // server down; the channel has room for the event
            let _ = daemon_tx.try_send(DaemonEvent::ShutdownRequested);
            Response::ok(ResponseData::None)
        }
        Request::Ping => Response::ok(ResponseData::None),
    }
}

async fn reload(supervisor: &Arc<Supervisor>, config_path: &PathBuf) {
    info!("Reloading configuration from {:?}", config_path);
    match LocalportConfig::load(config_path) {
        Ok(config) => {
            let results = supervisor.apply_config(&config).await;
            for result in results.iter().filter(|r| !r.success) {
                warn!(
                    "Reload: service {} failed: {}",
                    result.service,
                    result.message.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Err(e) => {
            // A broken config on reload never takes the running fleet down
            error!("Reload aborted, keeping current configuration: {}", e);
        }
    }
}

/// Periodic reconciler: sweeps records whose child PID vanished without a
/// waiter event (adopted forwards, missed notifications) so degraded
/// services recover even when nobody runs `status`.
fn spawn_reconciler(registry: &Arc<TaskRegistry>, supervisor: &Arc<Supervisor>) {
    let token = CancellationToken::new();
    let tick_token = token.clone();
    let supervisor = Arc::clone(supervisor);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tick_token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
            supervisor.reconcile_tick();
        }
    });
    registry.register(
        "reconciler",
        PRIORITY_MAINTENANCE,
        vec!["maintenance".to_string()],
        token,
        handle,
    );
}

fn spawn_log_sweeper(registry: &Arc<TaskRegistry>) {
    let token = CancellationToken::new();
    let sweep_token = token.clone();
    let logs_dir = Daemon::service_logs_dir();
    let handle = tokio::spawn(async move {
        loop {
            sweep_rotated_logs(&logs_dir, DEFAULT_RETENTION, DEFAULT_MAX_ROTATIONS);
            tokio::select! {
                _ = sweep_token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
        }
    });
    registry.register(
        "log-sweeper",
        PRIORITY_MAINTENANCE,
        vec!["maintenance".to_string()],
        token,
        handle,
    );
}
