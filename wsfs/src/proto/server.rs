use super::handler::Dispatcher;
use crate::fs::Wsfs;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub enum Transport {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

pub struct WsfsServer {
    filesystem: Arc<Wsfs>,
    transport: Transport,
    max_message_size: usize,
}

impl WsfsServer {
    pub fn new(filesystem: Arc<Wsfs>, addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            filesystem,
            transport: Transport::Tcp(addr),
            max_message_size,
        }
    }

    pub fn new_unix(filesystem: Arc<Wsfs>, path: PathBuf, max_message_size: usize) -> Self {
        Self {
            filesystem,
            transport: Transport::Unix(path),
            max_message_size,
        }
    }

    pub async fn start(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        match &self.transport {
            Transport::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("Listening on TCP {}", addr);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("TCP server shutting down on {}", addr);
                            break;
                        }
                        result = listener.accept() => {
                            let (stream, peer_addr) = result?;
                            info!("Driver connected from {}", peer_addr);
                            stream.set_nodelay(true)?;

                            let max_message_size = self.max_message_size;
                            let dispatcher = Dispatcher::new(Arc::clone(&self.filesystem), max_message_size);
                            let client_shutdown = shutdown.child_token();

                            tokio::spawn(async move {
                                if let Err(e) = handle_client_stream(stream, dispatcher, max_message_size, client_shutdown).await {
                                    error!("Error handling client {}: {}", peer_addr, e);
                                }
                                info!("Driver {} disconnected", peer_addr);
                            });
                        }
                    }
                }
            }
            Transport::Unix(path) => {
                let _ = std::fs::remove_file(path);

                let listener = UnixListener::bind(path).map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!("Failed to bind Unix socket at {:?}: {}", path, e),
                    )
                })?;
                info!("Listening on Unix socket {:?}", path);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Unix socket server shutting down at {:?}", path);
                            break;
                        }
                        result = listener.accept() => {
                            let (stream, _) = result?;
                            info!("Driver connected via Unix socket");

                            let max_message_size = self.max_message_size;
                            let dispatcher = Dispatcher::new(Arc::clone(&self.filesystem), max_message_size);
                            let client_shutdown = shutdown.child_token();

                            tokio::spawn(async move {
                                if let Err(e) = handle_client_stream(stream, dispatcher, max_message_size, client_shutdown).await {
                                    error!("Error handling Unix client: {}", e);
                                }
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Serves one connection. Each frame is answered before the next is read.
pub async fn handle_client_stream<S>(
    stream: S,
    dispatcher: Dispatcher,
    max_message_size: usize,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_message_size)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Closing client connection on shutdown");
                return Ok(());
            }
            frame = framed.next() => frame,
        };

        let Some(frame) = frame else {
            return Ok(());
        };

        if let Some(reply) = dispatcher.handle_message(frame?.freeze()).await? {
            framed.send(reply).await?;
        }
    }
}
