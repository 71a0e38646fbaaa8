use std::path::Path;

use tokio::{io::AsyncWriteExt, net::UnixStream};

use crate::{
    errors::ClientError,
    protocol::{
        decode_response, encode_request, read_frame, Frame, Request, Response, ServiceSelector,
    },
};

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connect to the daemon at the given socket path
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;
        Ok(Self { stream })
    }

    /// Check if a daemon is running by attempting a ping
    pub async fn is_daemon_running(socket_path: &Path) -> bool {
        if !socket_path.exists() {
            return false;
        }

        match UnixStream::connect(socket_path).await {
            Ok(stream) => {
                let mut client = Self { stream };
                matches!(
                    client.send_request(&Request::Ping).await,
                    Ok(Response::Ok { .. })
                )
            }
            Err(_) => false,
        }
    }

    /// Send a request and receive a response
    pub async fn send_request(&mut self, request: &Request) -> Result<Response> {
        let request_type = request.type_name();
        let bytes = encode_request(request)?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| ClientError::Send {
                request_type,
                source: e,
            })?;

        match read_frame(&mut self.stream)
            .await
            .map_err(|e| ClientError::Receive {
                request_type,
                source: e,
            })? {
            Frame::Message(payload) => Ok(decode_response(&payload)?),
            Frame::Eof => Err(ClientError::Disconnected),
            Frame::TooLarge => Err(ClientError::MessageTooLarge),
        }
    }

    /// Start the selected services
    pub async fn start(&mut self, selector: ServiceSelector) -> Result<Response> {
        self.send_request(&Request::Start { selector }).await
    }

    /// Stop the selected services
    pub async fn stop(&mut self, selector: ServiceSelector, orphans: bool) -> Result<Response> {
        self.send_request(&Request::Stop { selector, orphans })
            .await
    }

    /// Get the full status snapshot
    pub async fn status(&mut self) -> Result<Response> {
        self.send_request(&Request::Status).await
    }

    /// Re-read configuration and reconcile
    pub async fn reload(&mut self) -> Result<Response> {
        self.send_request(&Request::Reload).await
    }

    /// Resolve the service-log path for one service
    pub async fn logs(&mut self, service: String) -> Result<Response> {
        self.send_request(&Request::Logs { service }).await
    }

    /// Request an orderly daemon shutdown
    pub async fn daemon_stop(&mut self) -> Result<Response> {
        self.send_request(&Request::DaemonStop).await
    }
}
