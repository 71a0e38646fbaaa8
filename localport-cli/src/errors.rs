use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("daemon is not running (start it with: localport daemon start)")]
    DaemonNotRunning,

    #[error("{0}")]
    Client(#[from] localport_protocol::errors::ClientError),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("unexpected response from daemon")]
    UnexpectedResponse,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CliError>;
