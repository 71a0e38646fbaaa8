use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start port forwards
    Start {
        /// Service names (default: all services)
        services: Vec<String>,
        /// Select services by tag instead of name
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Stop port forwards
    Stop {
        /// Service names (default: all services)
        services: Vec<String>,
        /// Select services by tag instead of name
        #[arg(short, long)]
        tag: Vec<String>,
        /// Also terminate orphaned forwarders from removed config entries
        #[arg(long)]
        orphans: bool,
    },
    /// Show the status of every configured service
    Status,
    /// Re-read the configuration and reconcile running forwards
    Reload,
    /// Show the service log path, optionally with the last lines
    Logs {
        /// Service name
        service: String,
        /// Print the last N lines instead of just the path
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Manage the daemon process
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Start the daemon in the background
    Start {
        /// Path to the configuration file
        #[arg(short = 'f', long = "file")]
        file: Option<String>,
    },
    /// Stop the daemon (orderly, phased shutdown)
    Stop,
    /// Check whether the daemon is running
    Status,
}
