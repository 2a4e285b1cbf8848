//! Execution queue coordination.
//!
//! The daemon owns the queue. Windows ask it to queue, cancel or run all,
//! and learn the resulting order only from `queue_changed` broadcasts, so
//! every window shows the same queue no matter who enqueued what.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use runtimed::protocol::{NotebookRequest, NotebookResponse};
use serde::Serialize;

use crate::daemon::DaemonRpc;
use crate::error::SessionError;

/// Status of a queued cell
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CellQueueStatus {
    /// Waiting in queue
    Pending,
    /// Currently executing
    Executing,
}

/// A cell in the execution queue
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub cell_id: String,
    pub status: CellQueueStatus,
    /// Position in queue (0 = currently executing or next)
    pub position: usize,
}

/// The daemon's queue as last broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct QueueState {
    executing: Option<String>,
    pending: Vec<String>,
}

#[derive(Clone)]
pub struct ExecutionQueue {
    daemon: Arc<dyn DaemonRpc>,
    state: Arc<Mutex<QueueState>>,
}

impl ExecutionQueue {
    pub fn new(daemon: Arc<dyn DaemonRpc>) -> Self {
        Self {
            daemon,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Ask the daemon to queue a cell. Returns once the daemon has accepted
    /// it; the displayed queue changes only when the broadcast arrives.
    pub async fn enqueue(&self, cell_id: &str) -> Result<(), SessionError> {
        let response = self
            .daemon
            .request(NotebookRequest::ExecuteCell {
                cell_id: cell_id.to_string(),
            })
            .await?;
        match response {
            NotebookResponse::CellQueued { cell_id: queued } if queued == cell_id => Ok(()),
            other => Err(SessionError::unexpected("execute_cell", other)),
        }
    }

    /// Drop every pending cell. The executing cell keeps running.
    pub async fn cancel_all(&self) -> Result<Vec<String>, SessionError> {
        match self.daemon.request(NotebookRequest::CancelQueue {}).await? {
            NotebookResponse::QueueCancelled { cell_ids } => {
                info!("[queue] Cancelled {} cells", cell_ids.len());
                Ok(cell_ids)
            }
            other => Err(SessionError::unexpected("cancel_queue", other)),
        }
    }

    /// Queue every code cell in document order. Returns the queued ids.
    pub async fn run_all(&self) -> Result<Vec<String>, SessionError> {
        match self.daemon.request(NotebookRequest::RunAllCells {}).await? {
            NotebookResponse::AllCellsQueued { cell_ids } => {
                info!("[queue] Queued {} cells", cell_ids.len());
                Ok(cell_ids)
            }
            other => Err(SessionError::unexpected("run_all_cells", other)),
        }
    }

    /// Replace the displayed queue from the daemon's state.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        match self.daemon.request(NotebookRequest::GetQueueState {}).await? {
            NotebookResponse::QueueState { executing, queued } => {
                self.apply_queue_changed(executing, queued);
                Ok(())
            }
            other => Err(SessionError::unexpected("get_queue_state", other)),
        }
    }

    /// Apply a `queue_changed` broadcast. Duplicate ids keep their first
    /// position.
    pub fn apply_queue_changed(&self, executing: Option<String>, queued: Vec<String>) {
        let mut seen: HashSet<String> = executing.iter().cloned().collect();
        let mut pending = Vec::with_capacity(queued.len());
        for cell_id in queued {
            if seen.insert(cell_id.clone()) {
                pending.push(cell_id);
            } else {
                warn!("[queue] Dropping duplicate queue entry {}", cell_id);
            }
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = QueueState { executing, pending };
    }

    /// Forget the queue, e.g. when the daemon connection drops.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = QueueState::default();
    }

    pub fn executing(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .executing
            .clone()
    }

    pub fn pending(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .clone()
    }

    /// Executing cell first, then pending cells in order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let executing = state.executing.iter().map(|id| (id, CellQueueStatus::Executing));
        let pending = state.pending.iter().map(|id| (id, CellQueueStatus::Pending));
        executing
            .chain(pending)
            .enumerate()
            .map(|(position, (cell_id, status))| QueueEntry {
                cell_id: cell_id.clone(),
                status,
                position,
            })
            .collect()
    }

    pub fn position_of(&self, cell_id: &str) -> Option<usize> {
        self.entries()
            .into_iter()
            .find(|e| e.cell_id == cell_id)
            .map(|e| e.position)
    }

    pub fn is_queued(&self, cell_id: &str) -> bool {
        self.position_of(cell_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.executing.is_none() && state.pending.is_empty()
    }
}
