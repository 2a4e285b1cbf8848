//! The daemon as seen from one window.
//!
//! [`DaemonRpc`] is the request/response surface; [`DaemonConnector`] opens
//! a connection that also carries the document snapshot and broadcast
//! streams. [`SharedDaemon`] is the slot components hold so the underlying
//! connection can be swapped on reconnect without rebuilding them.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::info;
use runtimed::client::BlobClient;
use runtimed::notebook_doc::CellSnapshot;
use runtimed::notebook_sync_client::{NotebookSyncClient, NotebookSyncHandle};
use runtimed::protocol::{NotebookRequest, NotebookResponse};

use crate::error::SessionError;

/// Document snapshots, one per inbound change.
pub type SnapshotStream = BoxStream<'static, Vec<CellSnapshot>>;

/// Raw broadcast payloads in emission order. Ends when the daemon goes away.
pub type BroadcastStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait DaemonRpc: Send + Sync {
    /// Send one request and wait for its response.
    async fn request(&self, request: NotebookRequest) -> Result<NotebookResponse, SessionError>;

    /// Port of the daemon's blob HTTP server.
    async fn blob_port(&self) -> Result<u16, SessionError>;
}

/// A live connection to a notebook room.
pub struct DaemonConnection {
    pub rpc: Arc<dyn DaemonRpc>,
    pub initial_cells: Vec<CellSnapshot>,
    pub snapshots: SnapshotStream,
    pub broadcasts: BroadcastStream,
}

#[async_trait]
pub trait DaemonConnector: Send + Sync {
    async fn connect(&self, notebook_id: &str) -> Result<DaemonConnection, SessionError>;
}

/// Connects over the daemon's socket (named pipe on Windows).
#[derive(Debug, Clone)]
pub struct SocketConnector {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }
}

#[async_trait]
impl DaemonConnector for SocketConnector {
    async fn connect(&self, notebook_id: &str) -> Result<DaemonConnection, SessionError> {
        let (handle, changes, broadcasts, initial_cells) = NotebookSyncClient::connect_split(
            self.socket_path.clone(),
            notebook_id.to_string(),
            self.timeout,
        )
        .await?;

        info!(
            "[daemon] Joined room {} ({} cells)",
            notebook_id,
            initial_cells.len()
        );

        let snapshots = stream::unfold(changes, |mut rx| async move {
            rx.recv().await.map(|cells| (cells, rx))
        })
        .boxed();
        let broadcasts = stream::unfold(broadcasts, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })
        .boxed();

        Ok(DaemonConnection {
            rpc: Arc::new(SocketRpc {
                handle,
                blob: BlobClient::new(self.socket_path.clone()).with_timeout(self.timeout),
            }),
            initial_cells,
            snapshots,
            broadcasts,
        })
    }
}

struct SocketRpc {
    handle: NotebookSyncHandle,
    blob: BlobClient,
}

#[async_trait]
impl DaemonRpc for SocketRpc {
    async fn request(&self, request: NotebookRequest) -> Result<NotebookResponse, SessionError> {
        Ok(self.handle.send_request(request).await?)
    }

    async fn blob_port(&self) -> Result<u16, SessionError> {
        Ok(self.blob.port().await?)
    }
}

/// Swappable handle to the current connection's RPC surface.
#[derive(Clone, Default)]
pub struct SharedDaemon {
    current: Arc<RwLock<Option<Arc<dyn DaemonRpc>>>>,
}

impl SharedDaemon {
    pub fn set(&self, rpc: Arc<dyn DaemonRpc>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(rpc);
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn current(&self) -> Result<Arc<dyn DaemonRpc>, SessionError> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::NotConnected)
    }
}

#[async_trait]
impl DaemonRpc for SharedDaemon {
    async fn request(&self, request: NotebookRequest) -> Result<NotebookResponse, SessionError> {
        let rpc = self.current()?;
        rpc.request(request).await
    }

    async fn blob_port(&self) -> Result<u16, SessionError> {
        let rpc = self.current()?;
        rpc.blob_port().await
    }
}

/// Turn an mpsc receiver into a boxed stream.
pub fn receiver_stream<T: Send + 'static>(mut rx: tokio::sync::mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}
