use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::errors::ProtocolError;

/// Maximum message size (1MB): control traffic only, never log payloads
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Frames are newline-delimited JSON documents
pub const FRAME_DELIMITER: u8 = b'\n';

/// Which services an operation applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceSelector {
    /// Every configured service
    All,
    /// Services by name
    Names(Vec<String>),
    /// Services carrying at least one of these tags
    Tags(Vec<String>),
}

impl ServiceSelector {
    pub fn is_all(&self) -> bool {
        matches!(self, ServiceSelector::All)
    }
}

/// Request sent from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Start the selected services
    Start { selector: ServiceSelector },
    /// Stop the selected services. With `orphans`, also terminate orphaned
    /// forwarder processes left over from removed configuration entries.
    Stop {
        selector: ServiceSelector,
        #[serde(default)]
        orphans: bool,
    },
    /// Snapshot of every known service
    Status,
    /// Re-read configuration and reconcile the running set against it
    Reload,
    /// Resolve the service-log path for one service
    Logs { service: String },
    /// Shut the daemon down (orderly, phased)
    DaemonStop,
    /// Liveness check
    Ping,
}

impl Request {
    /// Stable name for error context and logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Start { .. } => "start",
            Request::Stop { .. } => "stop",
            Request::Status => "status",
            Request::Reload => "reload",
            Request::Logs { .. } => "logs",
            Request::DaemonStop => "daemon-stop",
            Request::Ping => "ping",
        }
    }
}

/// Per-service outcome of a start/stop/reload operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOpResult {
    pub service: String,
    pub success: bool,
    /// Diagnostic on failure ("port 5432 held by pid 4242 (postgres)"), or
    /// a note on success ("already running")
    pub message: Option<String>,
}

impl ServiceOpResult {
    pub fn ok(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            success: true,
            message: None,
        }
    }

    pub fn ok_with(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failed(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            success: false,
            message: Some(message.into()),
        }
    }
}

/// One row of the status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusInfo {
    pub id: String,
    pub name: String,
    pub technology: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Supervisor lifecycle state ("running", "restarting", ...)
    pub state: String,
    /// Last probe verdict ("healthy", "unhealthy", "unknown"), distinct
    /// from `state`; a running PID does not imply healthy
    pub health: String,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub restart_attempts: u32,
    pub tags: Vec<String>,
    pub log_path: Option<PathBuf>,
    pub last_error: Option<String>,
}

/// A forwarder PID recorded in persisted state whose configuration entry no
/// longer exists. Reported, never auto-killed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanInfo {
    pub id: String,
    pub name: String,
    pub pid: u32,
    pub local_port: u16,
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_pid: u32,
    pub daemon_started_at: i64,
    pub services: Vec<ServiceStatusInfo>,
    pub orphans: Vec<OrphanInfo>,
}

/// Payload of a successful response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    None,
    Operation { results: Vec<ServiceOpResult> },
    Status(StatusSnapshot),
    LogPath { service: String, path: PathBuf },
}

/// Response sent from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok { data: ResponseData },
    Error { message: String },
}

impl Response {
    pub fn ok(data: ResponseData) -> Self {
        Response::Ok { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value).map_err(ProtocolError::Encode)?;
    if bytes.len() >= MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}

/// Encode a request as one delimiter-terminated frame
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    encode(request)
}

/// Decode a request from a frame payload (delimiter already stripped)
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}

/// Encode a response as one delimiter-terminated frame
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    encode(response)
}

/// Decode a response from a frame payload (delimiter already stripped)
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
}

/// Outcome of one framing read
#[derive(Debug)]
pub enum Frame {
    /// A complete payload, delimiter stripped
    Message(Vec<u8>),
    /// The peer closed the stream before sending anything
    Eof,
    /// The peer blew past `MAX_MESSAGE_SIZE`; the connection is unusable
    TooLarge,
}

/// Read one delimiter-terminated frame from the stream.
///
/// The underlying reader is capped at `MAX_MESSAGE_SIZE + 1` bytes, so a
/// peer that never sends the delimiter cannot grow the buffer without
/// bound; the cap shows up as `TooLarge`. Both the client and the daemon
/// read their side of the conversation through this.
pub async fn read_frame<R>(stream: R) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream.take(MAX_MESSAGE_SIZE as u64 + 1));
    let mut frame = Vec::new();

    loop {
        let read = reader.read_until(FRAME_DELIMITER, &mut frame).await?;

        if frame.last() == Some(&FRAME_DELIMITER) {
            frame.pop();
            break;
        }
        if read == 0 {
            // EOF, or the size cap, before any delimiter arrived. A
            // truncated payload still goes to the decoder so the caller
            // reports a decode error rather than silently dropping it.
            if frame.is_empty() {
                return Ok(Frame::Eof);
            }
            break;
        }
    }

    if frame.len() > MAX_MESSAGE_SIZE {
        return Ok(Frame::TooLarge);
    }
    Ok(Frame::Message(frame))
}
