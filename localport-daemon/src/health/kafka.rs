//! Kafka broker metadata probe
//!
//! Speaks just enough of the Kafka wire protocol to issue a Metadata (v0)
//! request and count broker entries in the reply. A broker that accepts
//! the TCP connection but cannot answer metadata is not healthy, which is
//! precisely the state a half-dead port-forward produces.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ProbeSettings;

const API_KEY_METADATA: i16 = 3;
const API_VERSION: i16 = 0;
const CORRELATION_ID: i32 = 0x4c50; // "LP"
const CLIENT_ID: &str = "localport-health";

/// Response frames larger than this are not a health answer
const MAX_RESPONSE_SIZE: u32 = 4 * 1024 * 1024;

pub(super) async fn check(settings: &ProbeSettings, local_port: u16) -> Result<(), String> {
    let address = settings
        .bootstrap_servers
        .as_deref()
        .and_then(|servers| servers.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", local_port));

    let mut stream = TcpStream::connect(&address)
        .await
        .map_err(|e| format!("connect to broker {} failed: {}", address, e))?;

    stream
        .write_all(&metadata_request())
        .await
        .map_err(|e| format!("metadata request to {} failed: {}", address, e))?;

    let mut length_buf = [0u8; 4];
    stream
        .read_exact(&mut length_buf)
        .await
        .map_err(|e| format!("broker {} closed before responding: {}", address, e))?;
    let length = u32::from_be_bytes(length_buf);
    if length < 8 || length > MAX_RESPONSE_SIZE {
        return Err(format!("broker {} sent malformed frame ({} bytes)", address, length));
    }

    let mut body = vec![0u8; length as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| format!("short metadata response from {}: {}", address, e))?;

    let correlation_id = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if correlation_id != CORRELATION_ID {
        return Err(format!(
            "broker {} echoed wrong correlation id {}",
            address, correlation_id
        ));
    }

    let broker_count = i32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    if broker_count < 1 {
        return Err(format!("broker {} reported no brokers", address));
    }

    Ok(())
}

/// Metadata v0 request frame: header (api key, version, correlation id,
/// client id) plus an empty topic array (= all topics)
fn metadata_request() -> Vec<u8> {
    let mut body = Vec::with_capacity(32);
    body.extend_from_slice(&API_KEY_METADATA.to_be_bytes());
    body.extend_from_slice(&API_VERSION.to_be_bytes());
    body.extend_from_slice(&CORRELATION_ID.to_be_bytes());
    body.extend_from_slice(&(CLIENT_ID.len() as i16).to_be_bytes());
    body.extend_from_slice(CLIENT_ID.as_bytes());
    body.extend_from_slice(&0i32.to_be_bytes()); // topics: empty array

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
pub(super) fn request_frame_for_tests() -> Vec<u8> {
    metadata_request()
}
