//! Applying daemon broadcasts to window state.
//!
//! Broadcasts arrive on one channel per window in the order the daemon sent
//! them, and one task applies them one at a time. Output resolution is
//! awaited inline so a cell's outputs land in emission order even when some
//! need a blob fetch.

use std::sync::{Arc, Mutex, RwLock};

use futures::StreamExt;
use log::{debug, info, warn};
use runtimed::protocol::NotebookBroadcast;
use serde_json::{json, Value};

use crate::daemon::{BroadcastStream, DaemonRpc};
use crate::execution_queue::{ExecutionQueue, QueueEntry};
use crate::kernel_session::{KernelSession, KernelStatus};
use crate::manifest_resolver::ManifestResolver;
use crate::reconcile::{CellOutput, CellStore};
use crate::trust_gate::TrustCheck;

/// Latest environment preparation progress from the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvProgress {
    pub env_type: String,
    pub phase: Value,
    pub message: Option<String>,
}

/// Things a window's UI may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    KernelStatus(KernelStatus),
    ExecutionStarted { cell_id: String, execution_count: i64 },
    Output { cell_id: String, output: Value },
    DisplayUpdated { display_id: String, updated: usize },
    ExecutionDone { cell_id: String },
    QueueChanged(Vec<QueueEntry>),
    KernelError { error: String },
    OutputsCleared { cell_id: String },
    /// `comm` and `comm_sync` broadcasts, untouched.
    Comm(NotebookBroadcast),
    EnvProgress(EnvProgress),
    /// A document snapshot was merged.
    CellsChanged,
    /// A launch is parked until the user approves the dependencies.
    TrustApprovalRequired(TrustCheck),
    TrustChanged(TrustCheck),
    Disconnected,
    Reconnected,
    ReconnectFailed { attempts: u32 },
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Holds the current UI callback. The session subscribes once; the UI can
/// swap its callback in and out without resubscribing.
#[derive(Clone, Default)]
pub struct ListenerSlot {
    current: Arc<RwLock<Option<Listener>>>,
}

impl ListenerSlot {
    pub fn set(&self, listener: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn emit(&self, event: &SessionEvent) {
        let listener = self
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }
}

/// Decode a raw broadcast. Malformed and unknown events are logged and
/// dropped.
pub fn decode_broadcast(payload: &[u8]) -> Option<NotebookBroadcast> {
    match serde_json::from_slice::<NotebookBroadcast>(payload) {
        Ok(NotebookBroadcast::Unknown) => {
            debug!(
                "[dispatcher] Ignoring unknown broadcast: {}",
                String::from_utf8_lossy(payload)
            );
            None
        }
        Ok(event) => Some(event),
        Err(e) => {
            warn!("[dispatcher] Ignoring malformed broadcast: {}", e);
            None
        }
    }
}

/// Error output shown on the executing cell when the kernel fails.
pub fn kernel_error_output(error: &str) -> Value {
    json!({
        "output_type": "error",
        "ename": "KernelError",
        "evalue": error,
        "traceback": [],
    })
}

#[derive(Clone)]
pub struct BroadcastDispatcher {
    pub(crate) kernel: KernelSession,
    pub(crate) queue: ExecutionQueue,
    pub(crate) cells: CellStore,
    pub(crate) resolver: ManifestResolver,
    pub(crate) daemon: Arc<dyn DaemonRpc>,
    pub(crate) listeners: ListenerSlot,
    pub(crate) env_progress: Arc<Mutex<Option<EnvProgress>>>,
}

impl BroadcastDispatcher {
    /// Apply broadcasts until the stream ends, i.e. the daemon went away.
    pub async fn run(&self, mut broadcasts: BroadcastStream) {
        while let Some(payload) = broadcasts.next().await {
            self.dispatch(&payload).await;
        }
        info!("[dispatcher] Broadcast stream ended");
    }

    pub async fn dispatch(&self, payload: &[u8]) {
        if let Some(event) = decode_broadcast(payload) {
            self.handle(event).await;
        }
    }

    /// Cells whose outputs the doc may not have yet: this window's runs
    /// and whatever the daemon is executing now.
    fn is_live(&self, cell_id: &str) -> bool {
        self.cells.is_protected(cell_id) || self.queue.executing().as_deref() == Some(cell_id)
    }

    pub async fn handle(&self, event: NotebookBroadcast) {
        let emitted = match event {
            NotebookBroadcast::KernelStatus { status, .. } => {
                self.kernel.apply_status(&status).map(SessionEvent::KernelStatus)
            }
            NotebookBroadcast::ExecutionStarted {
                cell_id,
                execution_count,
            } => {
                self.cells.set_execution_count(&cell_id, execution_count);
                Some(SessionEvent::ExecutionStarted {
                    cell_id,
                    execution_count,
                })
            }
            NotebookBroadcast::Output { cell_id, .. } if !self.is_live(&cell_id) => {
                debug!("[dispatcher] Leaving output for idle cell {} to the doc", cell_id);
                None
            }
            NotebookBroadcast::Output {
                cell_id,
                output_json,
                ..
            } => match self.resolver.resolve(&output_json).await {
                Some(output) => {
                    self.cells
                        .append_output(&cell_id, output_json, CellOutput::Resolved(output.clone()));
                    Some(SessionEvent::Output { cell_id, output })
                }
                None => {
                    warn!("[dispatcher] Dropping unresolvable output for {}", cell_id);
                    None
                }
            },
            NotebookBroadcast::DisplayUpdate {
                display_id,
                data,
                metadata,
            } => {
                let updated = self.cells.update_display(&display_id, &data, &metadata);
                Some(SessionEvent::DisplayUpdated {
                    display_id,
                    updated,
                })
            }
            NotebookBroadcast::ExecutionDone { cell_id } => {
                self.cells.mark_not_executing(&cell_id, &self.daemon);
                Some(SessionEvent::ExecutionDone { cell_id })
            }
            NotebookBroadcast::QueueChanged { executing, queued } => {
                self.queue.apply_queue_changed(executing, queued);
                Some(SessionEvent::QueueChanged(self.queue.entries()))
            }
            NotebookBroadcast::KernelError { error } => {
                self.kernel.apply_error(&error);
                if let Some(cell_id) = self.queue.executing() {
                    let output = kernel_error_output(&error);
                    self.cells
                        .append_output(&cell_id, output.to_string(), CellOutput::Resolved(output));
                }
                Some(SessionEvent::KernelError { error })
            }
            NotebookBroadcast::OutputsCleared { cell_id } => {
                self.cells.clear_outputs(&cell_id);
                Some(SessionEvent::OutputsCleared { cell_id })
            }
            event @ (NotebookBroadcast::Comm { .. } | NotebookBroadcast::CommSync { .. }) => {
                Some(SessionEvent::Comm(event))
            }
            NotebookBroadcast::EnvProgress {
                env_type,
                phase,
                message,
            } => {
                let progress = EnvProgress {
                    env_type,
                    phase,
                    message,
                };
                *self.env_progress.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(progress.clone());
                Some(SessionEvent::EnvProgress(progress))
            }
            NotebookBroadcast::Unknown => None,
        };

        if let Some(event) = emitted {
            self.listeners.emit(&event);
        }
    }
}
