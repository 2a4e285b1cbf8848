//! One window's session on a daemon-managed notebook.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::StreamExt;
use log::{error, info, warn};
use runtimed::protocol::{NotebookRequest, NotebookResponse};
use runtimed::{EnvType, PoolError, PoolStats};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::daemon::{DaemonConnection, DaemonConnector, DaemonRpc, SharedDaemon, SocketConnector};
use crate::dispatcher::{BroadcastDispatcher, EnvProgress, ListenerSlot, SessionEvent};
use crate::error::SessionError;
use crate::execution_queue::{ExecutionQueue, QueueEntry};
use crate::kernel_session::{KernelInfo, KernelSession, KernelStatus, LaunchOutcome};
use crate::manifest_resolver::{BlobEndpoint, HttpBlobEndpoint, ManifestResolver};
use crate::reconcile::{CellState, CellStore, PendingOutput};
use crate::trust_gate::{DaemonTrust, GateDecision, PendingLaunch, TrustBackend, TrustCheck, TrustGate};

#[derive(Default)]
struct PoolState {
    stats: PoolStats,
    dismissed: HashSet<EnvType>,
}

struct Inner {
    notebook_id: String,
    config: SessionConfig,
    connector: Arc<dyn DaemonConnector>,
    daemon: SharedDaemon,
    dispatcher: BroadcastDispatcher,
    trust: TrustGate,
    pool: Mutex<PoolState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn rpc(&self) -> &Arc<dyn DaemonRpc> {
        &self.dispatcher.daemon
    }

    fn emit(&self, event: SessionEvent) {
        self.dispatcher.listeners.emit(&event);
    }

    /// Start consuming a fresh connection.
    fn attach(self: &Arc<Self>, connection: DaemonConnection) {
        let DaemonConnection {
            rpc,
            initial_cells,
            mut snapshots,
            broadcasts,
        } = connection;
        self.daemon.set(rpc);

        let initial_pending = self.dispatcher.cells.apply_snapshot(&initial_cells);
        self.emit(SessionEvent::CellsChanged);

        let dispatcher = self.dispatcher.clone();
        let snapshot_task = tokio::spawn(async move {
            resolve_pending(&dispatcher, initial_pending).await;
            while let Some(cells) = snapshots.next().await {
                let pending = dispatcher.cells.apply_snapshot(&cells);
                dispatcher.listeners.emit(&SessionEvent::CellsChanged);
                resolve_pending(&dispatcher, pending).await;
            }
        });

        let dispatcher = self.dispatcher.clone();
        let session: Weak<Inner> = Arc::downgrade(self);
        let broadcast_task = tokio::spawn(async move {
            dispatcher.run(broadcasts).await;
            if let Some(inner) = session.upgrade() {
                Inner::handle_disconnect(inner).await;
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(snapshot_task);
        tasks.push(broadcast_task);
    }

    /// Pick up kernel and queue state after connecting. After a reconnect
    /// the kernel may take a moment to re-register, so kernel info is
    /// retried; on first connect one answer is enough.
    async fn sync_after_connect(&self, reconnecting: bool) {
        let kernel = &self.dispatcher.kernel;
        let refreshed = if reconnecting {
            kernel.refresh_info(self.config.kernel_info_retry).await
        } else {
            kernel.refresh_once().await
        };
        match refreshed {
            Ok(status) => self.emit(SessionEvent::KernelStatus(status)),
            Err(e) => warn!("[notebook-session] Kernel info unavailable: {}", e),
        }

        match self.dispatcher.queue.refresh().await {
            Ok(()) => self.emit(SessionEvent::QueueChanged(self.dispatcher.queue.entries())),
            Err(e) => warn!("[notebook-session] Queue state unavailable: {}", e),
        }
    }

    async fn handle_disconnect(self: Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            "[notebook-session] Lost daemon connection for {}",
            self.notebook_id
        );

        self.daemon.clear();
        self.dispatcher.kernel.reset();
        self.dispatcher.queue.reset();
        self.trust.clear_cache();
        self.dispatcher.resolver.invalidate_port();
        for cell_id in self.dispatcher.cells.protected() {
            self.dispatcher.cells.mark_not_executing(&cell_id, self.rpc());
        }
        self.emit(SessionEvent::Disconnected);
        self.emit(SessionEvent::KernelStatus(KernelStatus::NotStarted));
        self.emit(SessionEvent::QueueChanged(Vec::new()));

        let policy = self.config.reconnect_retry;
        for attempt in 0..policy.attempts() {
            tokio::time::sleep(policy.delay_for(attempt)).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.connector.connect(&self.notebook_id).await {
                Ok(connection) => {
                    info!(
                        "[notebook-session] Reconnected to {} (attempt {})",
                        self.notebook_id,
                        attempt + 1
                    );
                    self.attach(connection);
                    self.sync_after_connect(true).await;
                    self.emit(SessionEvent::Reconnected);
                    return;
                }
                Err(e) => {
                    warn!(
                        "[notebook-session] Reconnect attempt {}/{} failed: {}",
                        attempt + 1,
                        policy.attempts(),
                        e
                    );
                }
            }
        }

        error!(
            "[notebook-session] Giving up on {} after {} attempts",
            self.notebook_id,
            policy.attempts()
        );
        self.emit(SessionEvent::ReconnectFailed {
            attempts: policy.attempts(),
        });
    }
}

/// Fetch outputs a snapshot left as hashes and fill them in.
async fn resolve_pending(dispatcher: &BroadcastDispatcher, pending: Vec<PendingOutput>) {
    if pending.is_empty() {
        return;
    }
    for output in pending {
        let value = dispatcher.resolver.resolve(&output.hash).await;
        dispatcher
            .cells
            .fill_resolved(&output.cell_id, &output.hash, value);
    }
    dispatcher.listeners.emit(&SessionEvent::CellsChanged);
}

/// Configures how a session reaches the daemon. Unset parts use the
/// daemon socket, HTTP blob fetches and daemon-side trust.
pub struct SessionBuilder {
    notebook_id: String,
    config: SessionConfig,
    connector: Option<Arc<dyn DaemonConnector>>,
    blob_endpoint: Option<Arc<dyn BlobEndpoint>>,
    trust_backend: Option<Arc<dyn TrustBackend>>,
}

impl SessionBuilder {
    pub fn connector(mut self, connector: Arc<dyn DaemonConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn blob_endpoint(mut self, endpoint: Arc<dyn BlobEndpoint>) -> Self {
        self.blob_endpoint = Some(endpoint);
        self
    }

    pub fn trust_backend(mut self, backend: Arc<dyn TrustBackend>) -> Self {
        self.trust_backend = Some(backend);
        self
    }

    pub async fn connect(self) -> Result<NotebookSession, SessionError> {
        let config = self.config;
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(SocketConnector::new(
                config.socket_path.clone(),
                config.connect_timeout(),
            ))
        });
        let endpoint = self
            .blob_endpoint
            .unwrap_or_else(|| Arc::new(HttpBlobEndpoint::new()));

        let daemon = SharedDaemon::default();
        let rpc: Arc<dyn DaemonRpc> = Arc::new(daemon.clone());
        let trust_backend = self
            .trust_backend
            .unwrap_or_else(|| Arc::new(DaemonTrust::new(rpc.clone())));

        let dispatcher = BroadcastDispatcher {
            kernel: KernelSession::new(rpc.clone()),
            queue: ExecutionQueue::new(rpc.clone()),
            cells: CellStore::new(),
            resolver: ManifestResolver::new(rpc.clone(), endpoint, config.blob_port_retry),
            daemon: rpc,
            listeners: ListenerSlot::default(),
            env_progress: Arc::new(Mutex::new(None)),
        };

        let connection = connector.connect(&self.notebook_id).await?;
        info!("[notebook-session] Connected to {}", self.notebook_id);

        let inner = Arc::new(Inner {
            notebook_id: self.notebook_id,
            config,
            connector,
            daemon,
            dispatcher,
            trust: TrustGate::new(trust_backend),
            pool: Mutex::new(PoolState::default()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        inner.attach(connection);
        inner.sync_after_connect(false).await;

        Ok(NotebookSession { inner })
    }
}

/// A window's view of one notebook room.
///
/// Cloning gives another handle to the same session.
#[derive(Clone)]
pub struct NotebookSession {
    inner: Arc<Inner>,
}

impl NotebookSession {
    pub fn builder(notebook_id: impl Into<String>, config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            notebook_id: notebook_id.into(),
            config,
            connector: None,
            blob_endpoint: None,
            trust_backend: None,
        }
    }

    /// Join a notebook room over the daemon socket.
    pub async fn connect(
        notebook_id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        Self::builder(notebook_id, config).connect().await
    }

    pub fn notebook_id(&self) -> &str {
        &self.inner.notebook_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.daemon.is_connected()
    }

    /// Replace the event callback.
    pub fn set_listener(&self, listener: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        self.inner.dispatcher.listeners.set(listener);
    }

    pub fn clear_listener(&self) {
        self.inner.dispatcher.listeners.clear();
    }

    // -- State --------------------------------------------------------------

    pub fn kernel_info(&self) -> KernelInfo {
        self.inner.dispatcher.kernel.info()
    }

    pub fn kernel_status(&self) -> KernelStatus {
        self.inner.dispatcher.kernel.status()
    }

    pub fn queue(&self) -> Vec<QueueEntry> {
        self.inner.dispatcher.queue.entries()
    }

    pub fn cells(&self) -> Vec<CellState> {
        self.inner.dispatcher.cells.cells()
    }

    pub fn cell(&self, cell_id: &str) -> Option<CellState> {
        self.inner.dispatcher.cells.cell(cell_id)
    }

    pub fn is_protected(&self, cell_id: &str) -> bool {
        self.inner.dispatcher.cells.is_protected(cell_id)
    }

    pub fn env_progress(&self) -> Option<EnvProgress> {
        self.inner
            .dispatcher
            .env_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Last trust check, cleared on disconnect.
    pub fn trust(&self) -> Option<TrustCheck> {
        self.inner.trust.last_check()
    }

    pub fn pending_launch(&self) -> Option<PendingLaunch> {
        self.inner.trust.pending_launch()
    }

    pub fn resolver(&self) -> &ManifestResolver {
        &self.inner.dispatcher.resolver
    }

    // -- Execution ----------------------------------------------------------

    /// Queue a cell. Its outputs are protected from snapshots until the
    /// daemon reports it done.
    pub async fn execute_cell(&self, cell_id: &str) -> Result<(), SessionError> {
        let cells = &self.inner.dispatcher.cells;
        let newly_protected = cells.mark_executing(cell_id);
        if let Err(e) = self.inner.dispatcher.queue.enqueue(cell_id).await {
            // An earlier run still in flight keeps its protection.
            if newly_protected {
                cells.mark_not_executing(cell_id, self.inner.rpc());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Queue every code cell. Returns the ids in queue order.
    pub async fn run_all(&self) -> Result<Vec<String>, SessionError> {
        let cell_ids = self.inner.dispatcher.queue.run_all().await?;
        for cell_id in &cell_ids {
            self.inner.dispatcher.cells.mark_executing(cell_id);
        }
        Ok(cell_ids)
    }

    /// Drop all pending cells. Returns the cancelled ids.
    pub async fn cancel_queue(&self) -> Result<Vec<String>, SessionError> {
        let cell_ids = self.inner.dispatcher.queue.cancel_all().await?;
        for cell_id in &cell_ids {
            self.inner
                .dispatcher
                .cells
                .mark_not_executing(cell_id, self.inner.rpc());
        }
        Ok(cell_ids)
    }

    pub async fn interrupt(&self) -> Result<bool, SessionError> {
        self.inner.dispatcher.kernel.interrupt().await
    }

    pub async fn clear_outputs(&self, cell_id: &str) -> Result<(), SessionError> {
        let response = self
            .inner
            .rpc()
            .request(NotebookRequest::ClearOutputs {
                cell_id: cell_id.to_string(),
            })
            .await?;
        match response {
            NotebookResponse::OutputsCleared { .. } => Ok(()),
            other => Err(SessionError::unexpected("clear_outputs", other)),
        }
    }

    /// Forward a widget comm message to the kernel.
    pub async fn send_comm(&self, message: Value) -> Result<(), SessionError> {
        match self
            .inner
            .rpc()
            .request(NotebookRequest::SendComm { message })
            .await?
        {
            NotebookResponse::Ok {} => Ok(()),
            other => Err(SessionError::unexpected("send_comm", other)),
        }
    }

    // -- Kernel lifecycle ---------------------------------------------------

    /// Launch with the configured kernel type and environment source.
    pub async fn launch_kernel(&self) -> Result<LaunchOutcome, SessionError> {
        let config = &self.inner.config;
        self.launch_kernel_with(PendingLaunch {
            kernel_type: config.default_kernel_type.clone(),
            env_source: config.default_env_source.clone(),
            notebook_path: None,
        })
        .await
    }

    /// Launch through the trust gate. An untrusted notebook gets
    /// `AwaitingApproval` and nothing is sent to the daemon.
    pub async fn launch_kernel_with(
        &self,
        launch: PendingLaunch,
    ) -> Result<LaunchOutcome, SessionError> {
        match self.inner.trust.gate_launch(launch.clone()).await? {
            GateDecision::Proceed(_) => self.start_kernel(&launch).await,
            GateDecision::Deferred(check) => {
                self.inner
                    .emit(SessionEvent::TrustApprovalRequired(check.clone()));
                Ok(LaunchOutcome::AwaitingApproval(check))
            }
        }
    }

    async fn start_kernel(&self, launch: &PendingLaunch) -> Result<LaunchOutcome, SessionError> {
        let kernel = &self.inner.dispatcher.kernel;
        let outcome = kernel.launch(launch).await?;
        self.inner.emit(SessionEvent::KernelStatus(kernel.status()));
        Ok(outcome)
    }

    pub async fn shutdown_kernel(&self) -> Result<(), SessionError> {
        let kernel = &self.inner.dispatcher.kernel;
        kernel.shutdown().await?;
        self.inner.emit(SessionEvent::KernelStatus(kernel.status()));
        Ok(())
    }

    // -- Trust --------------------------------------------------------------

    pub async fn check_trust(&self) -> Result<TrustCheck, SessionError> {
        self.inner.trust.check_trust().await
    }

    /// Approve the notebook's dependencies. A launch that was waiting on
    /// approval is started and its outcome returned.
    pub async fn approve_trust(&self) -> Result<Option<LaunchOutcome>, SessionError> {
        let (check, pending) = self.inner.trust.approve().await?;
        self.inner.emit(SessionEvent::TrustChanged(check));
        match pending {
            Some(launch) => self.start_kernel(&launch).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn decline_trust(&self) {
        self.inner.trust.decline();
    }

    /// Call after this window edits the notebook's dependencies.
    pub async fn dependencies_modified(&self) -> Result<TrustCheck, SessionError> {
        let check = self.inner.trust.dependencies_modified().await?;
        self.inner.emit(SessionEvent::TrustChanged(check.clone()));
        Ok(check)
    }

    // -- Environment pool ---------------------------------------------------

    pub async fn refresh_pool_status(&self) -> Result<PoolStats, SessionError> {
        let stats = match self
            .inner
            .rpc()
            .request(NotebookRequest::GetPoolStatus {})
            .await?
        {
            NotebookResponse::PoolStatus { stats } => stats,
            other => return Err(SessionError::unexpected("get_pool_status", other)),
        };

        let mut pool = self.inner.pool.lock().unwrap_or_else(|e| e.into_inner());
        // A dismissed error that went away stays dismissed only until it recurs.
        pool.dismissed
            .retain(|env_type| stats.error_for(*env_type).is_some());
        pool.stats = stats.clone();
        Ok(stats)
    }

    /// Pool warming errors the user hasn't dismissed.
    pub fn pool_errors(&self) -> Vec<(EnvType, PoolError)> {
        let pool = self.inner.pool.lock().unwrap_or_else(|e| e.into_inner());
        [EnvType::Uv, EnvType::Conda]
            .into_iter()
            .filter(|env_type| !pool.dismissed.contains(env_type))
            .filter_map(|env_type| {
                pool.stats
                    .error_for(env_type)
                    .map(|error| (env_type, error.clone()))
            })
            .collect()
    }

    pub fn dismiss_pool_error(&self, env_type: EnvType) {
        self.inner
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dismissed
            .insert(env_type);
    }

    /// Stop reconnecting and drop the daemon connection.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.inner.daemon.clear();
        info!("[notebook-session] Closed {}", self.inner.notebook_id);
    }
}
