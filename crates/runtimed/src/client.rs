//! Client for the daemon's blob channel.
//!
//! Notebook windows use this to learn which loopback port the daemon's blob
//! HTTP server is listening on. The port changes whenever the daemon
//! restarts, so callers cache it and ask again after a failed fetch.

use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::{self, Handshake};
use crate::default_socket_path;
use crate::protocol::{BlobRequest, BlobResponse};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon returned error: {0}")]
    DaemonError(String),

    #[error("Connection timeout")]
    Timeout,
}

/// Client for the blob channel.
#[derive(Debug, Clone)]
pub struct BlobClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl Default for BlobClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl BlobClient {
    /// Create a new client with a custom socket/pipe path.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Ask the daemon for the blob HTTP server port.
    pub async fn port(&self) -> Result<u16, ClientError> {
        #[cfg(unix)]
        let stream = {
            let connect_result =
                tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
                    .await;

            match connect_result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            }
        };

        #[cfg(windows)]
        let stream = {
            let pipe_name = self.socket_path.to_string_lossy().to_string();
            let connect_result = tokio::time::timeout(self.connect_timeout, async {
                // Named pipes may need retry if server is between connections
                let mut attempts = 0;
                loop {
                    match ClientOptions::new().open(&pipe_name) {
                        Ok(client) => return Ok(client),
                        Err(_) if attempts < 5 => {
                            attempts += 1;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await;

            match connect_result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            }
        };

        port_on_stream(stream).await
    }
}

/// Run the blob-channel port query on an established stream.
pub async fn port_on_stream<S>(mut stream: S) -> Result<u16, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    connection::send_json_frame(&mut stream, &Handshake::Blob)
        .await
        .map_err(|e| ClientError::ProtocolError(format!("handshake: {}", e)))?;

    connection::send_json_frame(&mut stream, &BlobRequest::GetPort)
        .await
        .map_err(|e| ClientError::ProtocolError(format!("send: {}", e)))?;

    let response = connection::recv_json_frame::<_, BlobResponse>(&mut stream)
        .await
        .map_err(|e| ClientError::ProtocolError(format!("recv: {}", e)))?
        .ok_or_else(|| ClientError::ProtocolError("connection closed".to_string()))?;

    match response {
        BlobResponse::Port { port } => {
            debug!("[blob-client] Blob server on port {}", port);
            Ok(port)
        }
        BlobResponse::Error { error } => Err(ClientError::DaemonError(error)),
    }
}
