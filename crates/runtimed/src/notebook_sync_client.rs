//! Client for the notebook sync channel.
//!
//! Each notebook window creates a `NotebookSyncClient` that keeps a local
//! Automerge replica of the notebook, sends requests to the daemon, and
//! receives the daemon's broadcasts for the notebook room.
//!
//! The client uses a split pattern with channels:
//! - `NotebookSyncHandle` is a clonable handle for sending commands
//! - `NotebookSyncReceiver` receives cell snapshots after each inbound change
//! - `NotebookBroadcastReceiver` receives raw broadcast payloads, in order
//! - A background task owns the connection and the Automerge state
//!
//! Responses carry no correlation id; the daemon answers requests in the
//! order it received them, so the task keeps a FIFO of waiting callers.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use automerge::sync::{self, SyncDoc};
use automerge::AutoCommit;
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::connection::{
    self, Handshake, NotebookFrameType, ProtocolCapabilities, TypedFrame, PROTOCOL_V2,
};
use crate::notebook_doc::{get_cells_from_doc, CellSnapshot};
use crate::protocol::{NotebookRequest, NotebookResponse};

/// How long the daemon may stay quiet before initial sync counts as done.
const INITIAL_SYNC_QUIET: Duration = Duration::from_millis(100);

/// Upper bound on a single request/response round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for notebook sync client operations.
#[derive(Debug, thiserror::Error)]
pub enum NotebookSyncError {
    #[error("Failed to connect: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Sync protocol error: {0}")]
    SyncError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Disconnected")]
    Disconnected,

    #[error("Channel closed")]
    ChannelClosed,
}

/// Commands sent from handles to the sync task.
#[derive(Debug)]
enum SyncCommand {
    GetCells {
        reply: oneshot::Sender<Vec<CellSnapshot>>,
    },
    SendRequest {
        request: NotebookRequest,
        reply: oneshot::Sender<Result<NotebookResponse, NotebookSyncError>>,
    },
}

/// Handle for sending commands to the notebook sync task.
#[derive(Clone)]
pub struct NotebookSyncHandle {
    tx: mpsc::Sender<SyncCommand>,
    notebook_id: String,
}

impl NotebookSyncHandle {
    /// Get the notebook ID this handle is connected to.
    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    /// Whether the background task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get all cells from the local replica.
    pub async fn get_cells(&self) -> Result<Vec<CellSnapshot>, NotebookSyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::GetCells { reply: reply_tx })
            .await
            .map_err(|_| NotebookSyncError::ChannelClosed)?;
        reply_rx.await.map_err(|_| NotebookSyncError::ChannelClosed)
    }

    /// Send a request to the daemon and wait for its response.
    pub async fn send_request(
        &self,
        request: NotebookRequest,
    ) -> Result<NotebookResponse, NotebookSyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::SendRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NotebookSyncError::ChannelClosed)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(reply) => reply.map_err(|_| NotebookSyncError::ChannelClosed)?,
            Err(_) => Err(NotebookSyncError::Timeout),
        }
    }
}

/// Receiver for cell snapshots produced by inbound document changes.
pub struct NotebookSyncReceiver {
    rx: mpsc::Receiver<Vec<CellSnapshot>>,
}

impl NotebookSyncReceiver {
    /// Wait for the next snapshot. Returns `None` once the sync task stops.
    pub async fn recv(&mut self) -> Option<Vec<CellSnapshot>> {
        self.rx.recv().await
    }
}

/// Receiver for broadcast payloads from the daemon.
///
/// Payloads are undecoded JSON; decoding (and tolerating unknown events)
/// is the consumer's job.
pub struct NotebookBroadcastReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl NotebookBroadcastReceiver {
    /// Wait for the next broadcast. Returns `None` once the sync task stops,
    /// which is how callers learn the daemon connection is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// The split parts of a connected client.
pub type SplitClient = (
    NotebookSyncHandle,
    NotebookSyncReceiver,
    NotebookBroadcastReceiver,
    Vec<CellSnapshot>,
);

/// Client for the notebook sync channel, before it is split.
pub struct NotebookSyncClient<S> {
    doc: AutoCommit,
    peer_state: sync::State,
    stream: S,
    notebook_id: String,
    /// Broadcasts received during initial sync, delivered first after split.
    pending_broadcasts: Vec<Vec<u8>>,
}

#[cfg(unix)]
impl NotebookSyncClient<tokio::net::UnixStream> {
    /// Connect to the daemon and join the notebook room.
    pub async fn connect(
        socket_path: PathBuf,
        notebook_id: String,
    ) -> Result<Self, NotebookSyncError> {
        Self::connect_with_timeout(socket_path, notebook_id, Duration::from_secs(2)).await
    }

    /// Connect with a custom timeout.
    pub async fn connect_with_timeout(
        socket_path: PathBuf,
        notebook_id: String,
        timeout: Duration,
    ) -> Result<Self, NotebookSyncError> {
        let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&socket_path))
            .await
            .map_err(|_| NotebookSyncError::Timeout)?
            .map_err(NotebookSyncError::ConnectionFailed)?;

        info!(
            "[notebook-sync-client] Connected to {:?} for {}",
            socket_path, notebook_id
        );

        Self::init(stream, notebook_id).await
    }

    /// Connect and return the split handle/receivers.
    pub async fn connect_split(
        socket_path: PathBuf,
        notebook_id: String,
        timeout: Duration,
    ) -> Result<SplitClient, NotebookSyncError> {
        let client = Self::connect_with_timeout(socket_path, notebook_id, timeout).await?;
        Ok(client.into_split())
    }
}

#[cfg(windows)]
impl NotebookSyncClient<tokio::net::windows::named_pipe::NamedPipeClient> {
    /// Connect to the daemon and join the notebook room.
    pub async fn connect(
        socket_path: PathBuf,
        notebook_id: String,
    ) -> Result<Self, NotebookSyncError> {
        let pipe_name = socket_path.to_string_lossy().to_string();
        let client = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&pipe_name)
            .map_err(NotebookSyncError::ConnectionFailed)?;
        Self::init(client, notebook_id).await
    }

    /// Connect and return the split handle/receivers.
    pub async fn connect_split(
        socket_path: PathBuf,
        notebook_id: String,
        timeout: Duration,
    ) -> Result<SplitClient, NotebookSyncError> {
        let client = tokio::time::timeout(timeout, Self::connect(socket_path, notebook_id))
            .await
            .map_err(|_| NotebookSyncError::Timeout)??;
        Ok(client.into_split())
    }
}

impl<S> NotebookSyncClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake and initial sync over an already-open stream.
    pub async fn from_stream(stream: S, notebook_id: String) -> Result<Self, NotebookSyncError> {
        Self::init(stream, notebook_id).await
    }

    /// Send the handshake, check the daemon speaks typed frames, then sync
    /// until the daemon goes quiet.
    async fn init(mut stream: S, notebook_id: String) -> Result<Self, NotebookSyncError> {
        connection::send_json_frame(
            &mut stream,
            &Handshake::NotebookSync {
                notebook_id: notebook_id.clone(),
                protocol: Some(PROTOCOL_V2.to_string()),
            },
        )
        .await
        .map_err(|e| NotebookSyncError::SyncError(format!("handshake: {}", e)))?;

        let caps_frame = connection::recv_control_frame(&mut stream)
            .await?
            .ok_or(NotebookSyncError::Disconnected)?;
        let caps: ProtocolCapabilities = serde_json::from_slice(&caps_frame)
            .map_err(|e| NotebookSyncError::SyncError(format!("capabilities: {}", e)))?;
        if caps.protocol != PROTOCOL_V2 {
            return Err(NotebookSyncError::SyncError(format!(
                "unsupported protocol {:?}",
                caps.protocol
            )));
        }

        let mut doc = AutoCommit::new();
        let mut peer_state = sync::State::new();

        if let Some(msg) = doc.sync().generate_sync_message(&mut peer_state) {
            connection::send_typed_frame(&mut stream, NotebookFrameType::AutomergeSync, &msg.encode())
                .await?;
        }

        let mut pending_broadcasts = Vec::new();
        loop {
            match tokio::time::timeout(INITIAL_SYNC_QUIET, connection::recv_typed_frame(&mut stream))
                .await
            {
                Ok(Ok(Some(frame))) => match frame.frame_type {
                    NotebookFrameType::AutomergeSync => {
                        apply_sync_message(&mut doc, &mut peer_state, &frame.payload)?;
                        if let Some(msg) = doc.sync().generate_sync_message(&mut peer_state) {
                            connection::send_typed_frame(
                                &mut stream,
                                NotebookFrameType::AutomergeSync,
                                &msg.encode(),
                            )
                            .await?;
                        }
                    }
                    NotebookFrameType::Broadcast => pending_broadcasts.push(frame.payload),
                    other => {
                        warn!(
                            "[notebook-sync-client] Unexpected {:?} frame during initial sync",
                            other
                        );
                    }
                },
                Ok(Ok(None)) => return Err(NotebookSyncError::Disconnected),
                Ok(Err(e)) => return Err(NotebookSyncError::ConnectionFailed(e)),
                Err(_) => break,
            }
        }

        info!(
            "[notebook-sync-client] Initial sync complete for {}: {} cells, {} pending broadcasts",
            notebook_id,
            get_cells_from_doc(&doc).len(),
            pending_broadcasts.len()
        );

        Ok(Self {
            doc,
            peer_state,
            stream,
            notebook_id,
            pending_broadcasts,
        })
    }

    /// Get the notebook ID this client is syncing.
    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    /// Get all cells from the local replica.
    pub fn get_cells(&self) -> Vec<CellSnapshot> {
        get_cells_from_doc(&self.doc)
    }
}

impl<S> NotebookSyncClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split this client into a handle, receivers, and the initial cells.
    ///
    /// The client is consumed and a background task is spawned that owns
    /// the connection. Broadcasts received during initial sync are
    /// delivered before any live broadcast.
    pub fn into_split(self) -> SplitClient {
        let initial_cells = self.get_cells();
        let notebook_id = self.notebook_id.clone();

        let (cmd_tx, cmd_rx) = mpsc::channel::<SyncCommand>(32);
        let (changes_tx, changes_rx) = mpsc::channel::<Vec<CellSnapshot>>(32);
        let (broadcast_tx, broadcast_rx) = mpsc::channel::<Vec<u8>>(64);

        let task_notebook_id = notebook_id.clone();
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(run_sync_task(
                self,
                cmd_rx,
                changes_tx,
                broadcast_tx,
            ))
            .catch_unwind()
            .await;

            if let Err(panic_info) = result {
                log::error!(
                    "[notebook-sync-task] PANIC in run_sync_task for {}: {:?}",
                    task_notebook_id,
                    panic_info
                );
            }
        });

        (
            NotebookSyncHandle {
                tx: cmd_tx,
                notebook_id,
            },
            NotebookSyncReceiver { rx: changes_rx },
            NotebookBroadcastReceiver { rx: broadcast_rx },
            initial_cells,
        )
    }
}

fn apply_sync_message(
    doc: &mut AutoCommit,
    peer_state: &mut sync::State,
    payload: &[u8],
) -> Result<(), NotebookSyncError> {
    let message = sync::Message::decode(payload)
        .map_err(|e| NotebookSyncError::SyncError(format!("decode: {}", e)))?;
    doc.sync()
        .receive_sync_message(peer_state, message)
        .map_err(|e| NotebookSyncError::SyncError(format!("receive: {}", e)))
}

/// Forward every frame from the read half until EOF or a read error.
async fn read_frames<S>(mut reader: ReadHalf<S>, frame_tx: mpsc::Sender<TypedFrame>)
where
    S: AsyncRead + Unpin,
{
    loop {
        match connection::recv_typed_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("[notebook-sync-task] Daemon closed the connection");
                break;
            }
            Err(e) => {
                warn!("[notebook-sync-task] Read error: {}", e);
                break;
            }
        }
    }
}

type PendingReply = oneshot::Sender<Result<NotebookResponse, NotebookSyncError>>;

/// Background task that owns the connection and the replica.
async fn run_sync_task<S>(
    client: NotebookSyncClient<S>,
    mut cmd_rx: mpsc::Receiver<SyncCommand>,
    changes_tx: mpsc::Sender<Vec<CellSnapshot>>,
    broadcast_tx: mpsc::Sender<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let NotebookSyncClient {
        mut doc,
        mut peer_state,
        stream,
        notebook_id,
        pending_broadcasts,
    } = client;

    for payload in pending_broadcasts {
        if broadcast_tx.send(payload).await.is_err() {
            break;
        }
    }

    let (reader, mut writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    let (frame_tx, mut frame_rx) = mpsc::channel::<TypedFrame>(64);
    let reader_task = tokio::spawn(read_frames(reader, frame_tx));

    let mut pending: VecDeque<PendingReply> = VecDeque::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    info!("[notebook-sync-task] All handles dropped for {}", notebook_id);
                    break;
                };
                match cmd {
                    SyncCommand::GetCells { reply } => {
                        let _ = reply.send(get_cells_from_doc(&doc));
                    }
                    SyncCommand::SendRequest { request, reply } => {
                        let payload = match serde_json::to_vec(&request) {
                            Ok(p) => p,
                            Err(e) => {
                                let _ = reply.send(Err(NotebookSyncError::SyncError(
                                    format!("serialize request: {}", e),
                                )));
                                continue;
                            }
                        };
                        debug!("[notebook-sync-task] -> {:?}", request);
                        if let Err(e) = connection::send_typed_frame(
                            &mut writer,
                            NotebookFrameType::Request,
                            &payload,
                        )
                        .await
                        {
                            warn!("[notebook-sync-task] Write failed for {}: {}", notebook_id, e);
                            let _ = reply.send(Err(NotebookSyncError::ConnectionFailed(e)));
                            break;
                        }
                        pending.push_back(reply);
                    }
                }
            }

            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    warn!("[notebook-sync-task] Disconnected from daemon for {}", notebook_id);
                    break;
                };
                match frame.frame_type {
                    NotebookFrameType::AutomergeSync => {
                        if let Err(e) = apply_sync_message(&mut doc, &mut peer_state, &frame.payload) {
                            warn!("[notebook-sync-task] {}", e);
                            continue;
                        }
                        if let Some(msg) = doc.sync().generate_sync_message(&mut peer_state) {
                            if let Err(e) = connection::send_typed_frame(
                                &mut writer,
                                NotebookFrameType::AutomergeSync,
                                &msg.encode(),
                            )
                            .await
                            {
                                warn!("[notebook-sync-task] Sync ack failed for {}: {}", notebook_id, e);
                                break;
                            }
                        }
                        if changes_tx.send(get_cells_from_doc(&doc)).await.is_err() {
                            info!("[notebook-sync-task] Changes receiver dropped for {}", notebook_id);
                            break;
                        }
                    }
                    NotebookFrameType::Broadcast => {
                        if broadcast_tx.send(frame.payload).await.is_err() {
                            info!("[notebook-sync-task] Broadcast receiver dropped for {}", notebook_id);
                            break;
                        }
                    }
                    NotebookFrameType::Response => {
                        let Some(reply) = pending.pop_front() else {
                            warn!("[notebook-sync-task] Response with no pending request for {}", notebook_id);
                            continue;
                        };
                        let response = serde_json::from_slice::<NotebookResponse>(&frame.payload)
                            .map_err(|e| NotebookSyncError::SyncError(format!("deserialize response: {}", e)));
                        let _ = reply.send(response);
                    }
                    NotebookFrameType::Request => {
                        warn!("[notebook-sync-task] Unexpected Request frame from daemon");
                    }
                }
            }
        }
    }

    for reply in pending.drain(..) {
        let _ = reply.send(Err(NotebookSyncError::Disconnected));
    }
    reader_task.abort();
    info!("[notebook-sync-task] Stopped for {}", notebook_id);
}
