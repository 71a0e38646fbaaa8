//! PostgreSQL startup handshake probe
//!
//! Sends a protocol-3.0 StartupMessage and reads the server's first reply.
//! ReadyForQuery or any authentication request counts as healthy: either
//! way a live PostgreSQL answered through the tunnel, and authenticating
//! is not this probe's job. An ErrorResponse or garbage is unhealthy.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ProbeSettings;

const PROTOCOL_VERSION: i32 = 196608; // 3.0

const MSG_AUTHENTICATION: u8 = b'R';
const MSG_READY_FOR_QUERY: u8 = b'Z';
const MSG_ERROR_RESPONSE: u8 = b'E';

const MAX_RESPONSE_SIZE: u32 = 64 * 1024;

pub(super) async fn check(settings: &ProbeSettings, local_port: u16) -> Result<(), String> {
    let host = settings.host.as_deref().unwrap_or("localhost");
    let port = settings.port.unwrap_or(local_port);
    let user = settings.user.as_deref().unwrap_or("postgres");
    let database = settings.database.as_deref().unwrap_or("postgres");

    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| format!("connect to {}:{} failed: {}", host, port, e))?;

    stream
        .write_all(&startup_message(user, database))
        .await
        .map_err(|e| format!("startup message to {}:{} failed: {}", host, port, e))?;

    // First server message: u8 type + i32 length (includes itself) + payload
    let mut header = [0u8; 5];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| format!("server {}:{} closed during handshake: {}", host, port, e))?;

    let message_type = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if length < 4 || length > MAX_RESPONSE_SIZE {
        return Err(format!(
            "server {}:{} sent malformed message ({} bytes)",
            host, port, length
        ));
    }

    let mut payload = vec![0u8; (length - 4) as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("short handshake response from {}:{}: {}", host, port, e))?;

    match message_type {
        MSG_AUTHENTICATION | MSG_READY_FOR_QUERY => Ok(()),
        MSG_ERROR_RESPONSE => Err(format!(
            "server {}:{} rejected startup: {}",
            host,
            port,
            error_message(&payload)
        )),
        other => Err(format!(
            "server {}:{} sent unexpected message type 0x{:02x}",
            host, port, other
        )),
    }
}

fn startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (key, value) in [("user", user), ("database", database)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0); // terminator

    let mut message = Vec::with_capacity(4 + body.len());
    message.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    message.extend_from_slice(&body);
    message
}

/// Pull the human-readable message (field tag 'M') out of an ErrorResponse
fn error_message(payload: &[u8]) -> String {
    let mut fields = payload.split(|&b| b == 0);
    while let Some(field) = fields.next() {
        if let Some((&tag, text)) = field.split_first() {
            if tag == b'M' {
                return String::from_utf8_lossy(text).into_owned();
            }
        }
    }
    "unknown error".to_string()
}

#[cfg(test)]
pub(super) fn startup_message_for_tests(user: &str, database: &str) -> Vec<u8> {
    startup_message(user, database)
}
