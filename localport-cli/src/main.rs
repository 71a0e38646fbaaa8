mod commands;
mod errors;

use std::io::{BufRead, BufReader};
use std::process::Stdio;

use chrono::{TimeZone, Utc};
use clap::Parser;
use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

use crate::commands::{Commands, DaemonCommands};
use crate::errors::{CliError, Result};
use localport_daemon::Daemon;
use localport_protocol::client::Client;
use localport_protocol::protocol::{
    Response, ResponseData, ServiceOpResult, ServiceSelector, StatusSnapshot,
};

/// LocalPort - supervised kubectl/ssh port forwards with health checks
#[derive(Parser, Debug)]
#[command(name = "localport")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Daemon lifecycle commands work without a running daemon
    if let Commands::Daemon { command } = &cli.command {
        return handle_daemon_command(command).await;
    }

    let socket_path = Daemon::socket_path();
    let mut client = match Client::connect(&socket_path).await {
        Ok(client) => client,
        Err(localport_protocol::errors::ClientError::Connect(_)) => {
            return Err(CliError::DaemonNotRunning);
        }
        Err(e) => return Err(e.into()),
    };

    match cli.command {
        Commands::Start { services, tag } => {
            let response = client.start(selector(services, tag)).await?;
            print_operation(response)
        }
        Commands::Stop {
            services,
            tag,
            orphans,
        } => {
            let response = client.stop(selector(services, tag), orphans).await?;
            print_operation(response)
        }
        Commands::Status => {
            let response = client.status().await?;
            print_status(response)
        }
        Commands::Reload => {
            let response = client.reload().await?;
            print_operation(response)
        }
        Commands::Logs { service, tail } => {
            let response = client.logs(service).await?;
            print_logs(response, tail)
        }
        Commands::Daemon { .. } => unreachable!("handled above"),
    }
}

fn selector(services: Vec<String>, tags: Vec<String>) -> ServiceSelector {
    if !services.is_empty() {
        ServiceSelector::Names(services)
    } else if !tags.is_empty() {
        ServiceSelector::Tags(tags)
    } else {
        ServiceSelector::All
    }
}

fn unwrap_ok(response: Response) -> Result<ResponseData> {
    match response {
        Response::Ok { data } => Ok(data),
        Response::Error { message } => Err(CliError::Daemon(message)),
    }
}

fn print_operation(response: Response) -> Result<()> {
    let results = match unwrap_ok(response)? {
        ResponseData::Operation { results } => results,
        ResponseData::None => return Ok(()),
        _ => return Err(CliError::UnexpectedResponse),
    };

    let mut failures = 0;
    for result in &results {
        print_result(result, &mut failures);
    }

    if failures > 0 {
        Err(CliError::Other(format!(
            "{} of {} services failed",
            failures,
            results.len()
        )))
    } else {
        Ok(())
    }
}

fn print_result(result: &ServiceOpResult, failures: &mut usize) {
    if result.success {
        match &result.message {
            Some(message) => println!("{} {} ({})", "✓".green(), result.service, message),
            None => println!("{} {}", "✓".green(), result.service),
        }
    } else {
        *failures += 1;
        println!(
            "{} {}: {}",
            "✗".red(),
            result.service,
            result.message.as_deref().unwrap_or("failed")
        );
    }
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "SERVICE")]
    name: String,
    #[tabled(rename = "TECH")]
    technology: String,
    #[tabled(rename = "FORWARD")]
    forward: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "HEALTH")]
    health: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "UPTIME")]
    uptime: String,
    #[tabled(rename = "RESTARTS")]
    restarts: String,
}

fn print_status(response: Response) -> Result<()> {
    let snapshot = match unwrap_ok(response)? {
        ResponseData::Status(snapshot) => snapshot,
        _ => return Err(CliError::UnexpectedResponse),
    };

    if snapshot.services.is_empty() && snapshot.orphans.is_empty() {
        println!("No services configured.");
        return Ok(());
    }

    let rows: Vec<StatusRow> = snapshot
        .services
        .iter()
        .map(|service| StatusRow {
            name: service.name.clone(),
            technology: service.technology.clone(),
            forward: format!("127.0.0.1:{} → {}", service.local_port, service.remote_port),
            state: colorize_state(&service.state),
            // Health is the probe verdict, not "does a PID exist"
            health: colorize_health(&service.health),
            pid: service
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            uptime: service
                .started_at
                .map(format_uptime)
                .unwrap_or_else(|| "-".to_string()),
            restarts: service.restart_attempts.to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);

    print_orphans(&snapshot);
    Ok(())
}

fn print_orphans(snapshot: &StatusSnapshot) {
    if snapshot.orphans.is_empty() {
        return;
    }
    println!();
    println!(
        "{} {} orphaned forwarder(s) from removed configuration:",
        "!".yellow().bold(),
        snapshot.orphans.len()
    );
    for orphan in &snapshot.orphans {
        println!(
            "  {} (pid {}, port {}), run `localport stop --orphans` to clean up",
            orphan.name, orphan.pid, orphan.local_port
        );
    }
}

fn colorize_state(state: &str) -> String {
    match state {
        "running" => state.green().to_string(),
        "starting" | "restarting" | "stopping" => state.yellow().to_string(),
        "unhealthy" | "failed" => state.red().to_string(),
        _ => state.to_string(),
    }
}

fn colorize_health(health: &str) -> String {
    match health {
        "healthy" => health.green().to_string(),
        "unhealthy" => health.red().to_string(),
        _ => health.dimmed().to_string(),
    }
}

fn format_uptime(started_at: i64) -> String {
    let started = match Utc.timestamp_opt(started_at, 0).single() {
        Some(ts) => ts,
        None => return "-".to_string(),
    };
    let seconds = (Utc::now() - started).num_seconds().max(0);
    match seconds {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s if s < 86400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86400, (s % 86400) / 3600),
    }
}

fn print_logs(response: Response, tail: Option<usize>) -> Result<()> {
    let (service, path) = match unwrap_ok(response)? {
        ResponseData::LogPath { service, path } => (service, path),
        _ => return Err(CliError::UnexpectedResponse),
    };

    match tail {
        None => {
            println!("{}", path.display());
            Ok(())
        }
        Some(lines) => {
            if !path.exists() {
                return Err(CliError::Other(format!(
                    "no log file yet for {} at {}",
                    service,
                    path.display()
                )));
            }
            let file = std::fs::File::open(&path)?;
            let all: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
            let start = all.len().saturating_sub(lines);
            for line in &all[start..] {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

async fn handle_daemon_command(command: &DaemonCommands) -> Result<()> {
    let socket_path = Daemon::socket_path();

    match command {
        DaemonCommands::Start { file } => {
            if Client::is_daemon_running(&socket_path).await {
                println!("Daemon is already running.");
                return Ok(());
            }

            let binary = find_daemon_binary()?;
            let mut command = std::process::Command::new(binary);
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if let Some(file) = file {
                command.env("LOCALPORT_CONFIG", file);
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }
            let child = command.spawn()?;
            println!("Daemon starting (pid {}).", child.id());

            // Give it a beat and confirm it came up
            for _ in 0..20 {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                if Client::is_daemon_running(&socket_path).await {
                    println!("Daemon is ready.");
                    return Ok(());
                }
            }
            Err(CliError::Other(format!(
                "daemon did not come up; check {}",
                Daemon::daemon_log_path().display()
            )))
        }
        DaemonCommands::Stop => {
            let mut client = match Client::connect(&socket_path).await {
                Ok(client) => client,
                Err(localport_protocol::errors::ClientError::Connect(_)) => {
                    println!("Daemon is not running.");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            unwrap_ok(client.daemon_stop().await?)?;
            println!("Daemon is shutting down.");
            Ok(())
        }
        DaemonCommands::Status => {
            if Client::is_daemon_running(&socket_path).await {
                println!("Daemon is running (socket {}).", socket_path.display());
            } else {
                println!("Daemon is not running.");
            }
            Ok(())
        }
    }
}

/// The daemon binary ships next to the CLI; fall back to PATH
fn find_daemon_binary() -> Result<std::path::PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("localportd");
        if sibling.is_file() {
            return Ok(sibling);
        }
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("localportd");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(CliError::Other(
        "cannot find the localportd binary (looked next to localport and on PATH)".to_string(),
    ))
}
