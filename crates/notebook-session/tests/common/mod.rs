//! In-process stand-ins for the daemon side of a notebook room.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notebook_session::daemon::{receiver_stream, DaemonConnection, DaemonConnector, DaemonRpc};
use notebook_session::{RetryPolicy, SessionConfig, SessionError, SessionEvent};
use runtimed::notebook_doc::CellSnapshot;
use runtimed::protocol::{NotebookRequest, NotebookResponse};
use serde_json::Value;
use tokio::sync::mpsc;

type Handler = Box<dyn Fn(&NotebookRequest) -> NotebookResponse + Send + Sync>;

/// Answers requests the way a daemon with no kernel running would, unless a
/// test installs its own handler. Every request is recorded.
pub struct FakeDaemon {
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<NotebookRequest>>,
    blob_port: Mutex<u16>,
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            blob_port: Mutex::new(0),
        })
    }

    pub fn respond_with(
        &self,
        handler: impl Fn(&NotebookRequest) -> NotebookResponse + Send + Sync + 'static,
    ) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn set_blob_port(&self, port: u16) {
        *self.blob_port.lock().unwrap() = port;
    }

    pub fn requests(&self) -> Vec<NotebookRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&NotebookRequest) -> bool) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| matches(r)).count()
    }
}

pub fn default_response(request: &NotebookRequest) -> NotebookResponse {
    match request {
        NotebookRequest::LaunchKernel {
            kernel_type,
            env_source,
            ..
        } => NotebookResponse::KernelLaunched {
            kernel_type: kernel_type.clone(),
            env_source: env_source.clone(),
        },
        NotebookRequest::ExecuteCell { cell_id } => NotebookResponse::CellQueued {
            cell_id: cell_id.clone(),
        },
        NotebookRequest::CancelQueue {} => NotebookResponse::QueueCancelled { cell_ids: vec![] },
        NotebookRequest::RunAllCells {} => NotebookResponse::AllCellsQueued { cell_ids: vec![] },
        NotebookRequest::ClearOutputs { cell_id } => NotebookResponse::OutputsCleared {
            cell_id: cell_id.clone(),
        },
        NotebookRequest::InterruptExecution {} => NotebookResponse::InterruptSent {},
        NotebookRequest::ShutdownKernel {} => NotebookResponse::KernelShuttingDown {},
        NotebookRequest::GetQueueState {} => NotebookResponse::QueueState {
            executing: None,
            queued: vec![],
        },
        NotebookRequest::GetKernelInfo {} => NotebookResponse::KernelInfo {
            kernel_type: None,
            env_source: None,
            status: "not_started".into(),
        },
        NotebookRequest::GetPoolStatus {} => NotebookResponse::PoolStatus {
            stats: Default::default(),
        },
        _ => NotebookResponse::Ok {},
    }
}

#[async_trait]
impl DaemonRpc for FakeDaemon {
    async fn request(&self, request: NotebookRequest) -> Result<NotebookResponse, SessionError> {
        self.requests.lock().unwrap().push(request.clone());
        let handler = self.handler.lock().unwrap();
        Ok(match handler.as_ref() {
            Some(handler) => handler(&request),
            None => default_response(&request),
        })
    }

    async fn blob_port(&self) -> Result<u16, SessionError> {
        Ok(*self.blob_port.lock().unwrap())
    }
}

/// One window's connection to the room.
#[derive(Clone)]
struct Window {
    broadcasts: mpsc::Sender<Vec<u8>>,
    snapshots: mpsc::Sender<Vec<CellSnapshot>>,
}

/// A notebook room. Every `connect` adds a window; broadcasts and
/// snapshots go to every connected window.
pub struct FakeRoom {
    daemon: Arc<FakeDaemon>,
    cells: Mutex<Vec<CellSnapshot>>,
    windows: Mutex<Vec<Window>>,
    failures: AtomicU32,
    connects: AtomicU32,
}

impl FakeRoom {
    pub fn new(daemon: Arc<FakeDaemon>) -> Arc<Self> {
        Arc::new(Self {
            daemon,
            cells: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        })
    }

    pub fn with_cells(daemon: Arc<FakeDaemon>, cells: Vec<CellSnapshot>) -> Arc<Self> {
        let room = Self::new(daemon);
        *room.cells.lock().unwrap() = cells;
        room
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn window_count(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    /// Drop every window's streams, as if the daemon went away.
    pub fn disconnect_all(&self) {
        self.windows.lock().unwrap().clear();
    }

    pub async fn broadcast(&self, event: Value) {
        let payload = serde_json::to_vec(&event).unwrap();
        let windows = self.windows.lock().unwrap().clone();
        for window in windows {
            let _ = window.broadcasts.send(payload.clone()).await;
        }
    }

    /// Replace the document and push it to every window.
    pub async fn set_cells(&self, cells: Vec<CellSnapshot>) {
        *self.cells.lock().unwrap() = cells.clone();
        let windows = self.windows.lock().unwrap().clone();
        for window in windows {
            let _ = window.snapshots.send(cells.clone()).await;
        }
    }
}

#[async_trait]
impl DaemonConnector for FakeRoom {
    async fn connect(&self, _notebook_id: &str) -> Result<DaemonConnection, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SessionError::Daemon("connection refused".into()));
        }

        let (broadcast_tx, broadcast_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(64);
        self.windows.lock().unwrap().push(Window {
            broadcasts: broadcast_tx,
            snapshots: snapshot_tx,
        });

        Ok(DaemonConnection {
            rpc: self.daemon.clone(),
            initial_cells: self.cells.lock().unwrap().clone(),
            snapshots: receiver_stream(snapshot_rx),
            broadcasts: receiver_stream(broadcast_rx),
        })
    }
}

pub fn code_cell(id: &str, execution_count: &str, outputs: &[&str]) -> CellSnapshot {
    CellSnapshot {
        id: id.into(),
        cell_type: "code".into(),
        source: format!("print({:?})", id),
        execution_count: execution_count.into(),
        outputs: outputs.iter().map(|o| o.to_string()).collect(),
        running: false,
    }
}

/// Short retries so reconnect tests finish quickly.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        kernel_info_retry: RetryPolicy::fixed(3, Duration::from_millis(10)),
        blob_port_retry: RetryPolicy::fixed(1, Duration::from_millis(10)),
        reconnect_retry: RetryPolicy::fixed(3, Duration::from_millis(10)),
        ..SessionConfig::default()
    }
}

/// Collects every event a session emits.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl EventLog {
    pub fn attach(session: &notebook_session::NotebookSession) -> Self {
        let log = Self::default();
        let sink = log.events.clone();
        session.set_listener(move |event| sink.lock().unwrap().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, matches: impl Fn(&SessionEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(|e| matches(e))
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
