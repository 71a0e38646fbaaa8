#[cfg(not(unix))]
compile_error!("localport-protocol server requires a unix target for socket security (peer credentials, file permissions)");

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::AsyncWriteExt,
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    errors::ServerError,
    protocol::{
        decode_request, encode_response, read_frame, Frame, Request, Response, MAX_MESSAGE_SIZE,
    },
};

pub type Result<T> = std::result::Result<T, ServerError>;
pub type ShutdownTx = mpsc::Sender<()>;

/// Control-surface server: accepts one request per connection on a Unix
/// socket and dispatches it to the async handler.
pub struct Server<F, Fut>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    socket_path: PathBuf,
    handler: Arc<F>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<F, Fut> Server<F, Fut>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    pub fn new(socket_path: PathBuf, handler: F) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            socket_path,
            handler: Arc::new(handler),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Sender that resolves the accept loop; the daemon's shutdown
    /// coordinator holds a clone so it can stop accepting during Quiesce.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let listener = bind_control_socket(&self.socket_path)?;
        info!("Control socket listening at {:?}", self.socket_path);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Control server stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("Failed to accept control connection: {}", e);
                            continue;
                        }
                    };
                    let handler = Arc::clone(&self.handler);
                    let shutdown_tx = self.shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(handler, stream, shutdown_tx).await {
                            debug!("Control connection ended with error: {}", e);
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

/// Remove any stale socket, bind, and clamp permissions to the owner
fn bind_control_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale control socket at {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ServerError::StaleSocket {
                socket_path: path.to_path_buf(),
                source: e,
            })
        }
    }

    let listener = UnixListener::bind(path).map_err(|e| ServerError::Bind {
        socket_path: path.to_path_buf(),
        source: e,
    })?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            ServerError::SocketPermissions {
                socket_path: path.to_path_buf(),
                source: e,
            }
        })?;
    }

    Ok(listener)
}

/// Only the daemon's own user may drive the control surface
fn authorize_peer(stream: &UnixStream) -> Result<()> {
    let cred = stream.peer_cred().map_err(ServerError::PeerCredentials)?;
    let daemon_uid = nix::unistd::getuid().as_raw();
    if cred.uid() == daemon_uid {
        Ok(())
    } else {
        Err(ServerError::Unauthorized {
            client_uid: cred.uid(),
            daemon_uid,
        })
    }
}

async fn respond(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let bytes = encode_response(response)?;
    stream.write_all(&bytes).await.map_err(ServerError::Send)
}

/// One request per connection: authorize, read a frame, dispatch, reply
async fn handle_client<F, Fut>(
    handler: Arc<F>,
    mut stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    if let Err(denied) = authorize_peer(&stream) {
        warn!("Rejected control connection: {}", denied);
        respond(&mut stream, &Response::error("unauthorized")).await?;
        return Err(denied);
    }

    let payload = match read_frame(&mut stream).await.map_err(ServerError::Receive)? {
        Frame::Message(payload) => payload,
        Frame::Eof => return Ok(()),
        Frame::TooLarge => {
            respond(
                &mut stream,
                &Response::error(format!(
                    "request exceeds maximum message size of {} bytes",
                    MAX_MESSAGE_SIZE
                )),
            )
            .await?;
            return Err(ServerError::MessageTooLarge);
        }
    };

    let request = match decode_request(&payload) {
        Ok(request) => request,
        Err(e) => {
            respond(&mut stream, &Response::error(format!("invalid request: {}", e))).await?;
            return Ok(());
        }
    };

    debug!("Handling {} request", request.type_name());
    let response = handler(request, shutdown_tx).await;
    respond(&mut stream, &response).await
}
