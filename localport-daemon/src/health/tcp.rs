//! TCP connect probe

use tokio::net::TcpStream;

/// Open a connection to the local forward endpoint and close it
/// immediately. Success is the connect itself.
pub(super) async fn check(local_port: u16) -> Result<(), String> {
    TcpStream::connect(("127.0.0.1", local_port))
        .await
        .map(drop)
        .map_err(|e| format!("connect to 127.0.0.1:{} failed: {}", local_port, e))
}
