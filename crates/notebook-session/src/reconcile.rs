//! Merging document snapshots into the window's cell state.
//!
//! Every inbound Automerge change produces a full `CellSnapshot` list.
//! Adopting it blindly would wipe outputs this window is streaming in for a
//! cell it just ran, because the daemon writes outputs to the doc later than
//! it broadcasts them. Cells the window is executing are *protected*: their
//! outputs and execution count stay local until the run finishes. Source,
//! type, order, additions and deletions always come from the snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use runtimed::notebook_doc::CellSnapshot;
use runtimed::output_store::is_blob_hash;
use runtimed::protocol::NotebookRequest;
use serde_json::{Map, Value};

use crate::daemon::DaemonRpc;
use crate::manifest_resolver::parse_inline_output;

/// One output slot of a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellOutput {
    Resolved(Value),
    /// Manifest hash not fetched yet.
    Pending(String),
    /// Could not be parsed or fetched; not rendered.
    Unresolvable(String),
}

impl CellOutput {
    /// Classify a raw output string from the doc.
    pub fn from_raw(raw: &str) -> Self {
        if is_blob_hash(raw) {
            return CellOutput::Pending(raw.to_string());
        }
        match parse_inline_output(raw) {
            Some(value) => CellOutput::Resolved(value),
            None => CellOutput::Unresolvable(raw.to_string()),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            CellOutput::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CellOutput::Pending(_))
    }
}

/// A cell as the window renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    pub id: String,
    pub cell_type: String,
    pub source: String,
    pub execution_count: Option<i64>,
    pub outputs: Vec<CellOutput>,
    /// Raw output strings, parallel to `outputs`.
    pub output_strings: Vec<String>,
    pub running: bool,
}

impl CellState {
    pub fn from_snapshot(snapshot: &CellSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            cell_type: snapshot.cell_type.clone(),
            source: snapshot.source.clone(),
            execution_count: parse_execution_count(&snapshot.execution_count),
            outputs: snapshot.outputs.iter().map(|raw| CellOutput::from_raw(raw)).collect(),
            output_strings: snapshot.outputs.clone(),
            running: snapshot.running,
        }
    }

    /// Outputs ready to render, in order.
    pub fn rendered_outputs(&self) -> Vec<&Value> {
        self.outputs.iter().filter_map(CellOutput::value).collect()
    }

    pub fn has_pending_outputs(&self) -> bool {
        self.outputs.iter().any(CellOutput::is_pending)
    }
}

/// `"5"` → `Some(5)`, `"null"` (or anything else) → `None`.
pub fn parse_execution_count(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

/// Merge a snapshot into local state.
///
/// With nothing protected the snapshot is adopted as-is. Otherwise each
/// protected cell keeps its local outputs, output strings and execution
/// count; everything else comes from the snapshot.
pub fn merge_snapshot(
    local: &[CellState],
    snapshot: &[CellSnapshot],
    protected: &HashSet<String>,
) -> Vec<CellState> {
    if protected.is_empty() {
        return snapshot.iter().map(CellState::from_snapshot).collect();
    }

    let local_by_id: HashMap<&str, &CellState> =
        local.iter().map(|cell| (cell.id.as_str(), cell)).collect();

    snapshot
        .iter()
        .map(|incoming| {
            let mut merged = CellState::from_snapshot(incoming);
            if protected.contains(&incoming.id) {
                if let Some(current) = local_by_id.get(incoming.id.as_str()) {
                    merged.outputs = current.outputs.clone();
                    merged.output_strings = current.output_strings.clone();
                    merged.execution_count = current.execution_count;
                }
            }
            merged
        })
        .collect()
}

/// An output slot waiting on a manifest fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutput {
    pub cell_id: String,
    pub hash: String,
}

#[derive(Default)]
struct StoreInner {
    cells: Vec<CellState>,
    protected: HashSet<String>,
}

/// The window's cells plus the set of cells it is executing.
#[derive(Clone, Default)]
pub struct CellStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl CellStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cells(&self) -> Vec<CellState> {
        self.lock().cells.clone()
    }

    pub fn cell(&self, cell_id: &str) -> Option<CellState> {
        self.lock().cells.iter().find(|c| c.id == cell_id).cloned()
    }

    /// Merge a snapshot and return the hashes still to fetch.
    pub fn apply_snapshot(&self, snapshot: &[CellSnapshot]) -> Vec<PendingOutput> {
        let mut inner = self.lock();
        let merged = merge_snapshot(&inner.cells, snapshot, &inner.protected);
        inner.cells = merged;
        pending_outputs(&inner.cells)
    }

    /// Fill every pending slot for `hash` in a cell.
    pub fn fill_resolved(&self, cell_id: &str, hash: &str, value: Option<Value>) {
        let mut inner = self.lock();
        let Some(cell) = inner.cells.iter_mut().find(|c| c.id == cell_id) else {
            return;
        };
        for output in cell.outputs.iter_mut() {
            if matches!(output, CellOutput::Pending(h) if h == hash) {
                *output = match &value {
                    Some(v) => CellOutput::Resolved(v.clone()),
                    None => CellOutput::Unresolvable(hash.to_string()),
                };
            }
        }
    }

    /// Protect a cell this window is about to execute.
    /// Returns false if the cell was already protected.
    pub fn mark_executing(&self, cell_id: &str) -> bool {
        let added = self.lock().protected.insert(cell_id.to_string());
        if added {
            debug!("[reconcile] Protecting {}", cell_id);
        }
        added
    }

    /// Drop protection for a finished cell and tell the daemon it's no longer
    /// running. The daemon update is best effort: one try, failures logged.
    pub fn mark_not_executing(&self, cell_id: &str, daemon: &Arc<dyn DaemonRpc>) {
        let was_protected = self.lock().protected.remove(cell_id);
        if !was_protected {
            return;
        }
        debug!("[reconcile] Unprotecting {}", cell_id);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("[reconcile] No runtime to clear running flag for {}", cell_id);
            return;
        };
        let daemon = daemon.clone();
        let cell_id = cell_id.to_string();
        runtime.spawn(async move {
            let request = NotebookRequest::SetCellRunning {
                cell_id: cell_id.clone(),
                running: false,
            };
            if let Err(e) = daemon.request(request).await {
                warn!(
                    "[reconcile] Failed to clear running flag for {}: {}",
                    cell_id, e
                );
            }
        });
    }

    pub fn is_protected(&self, cell_id: &str) -> bool {
        self.lock().protected.contains(cell_id)
    }

    pub fn protected(&self) -> HashSet<String> {
        self.lock().protected.clone()
    }

    /// Append an output the window received by broadcast.
    pub fn append_output(&self, cell_id: &str, raw: String, output: CellOutput) -> bool {
        let mut inner = self.lock();
        let Some(cell) = inner.cells.iter_mut().find(|c| c.id == cell_id) else {
            return false;
        };
        cell.outputs.push(output);
        cell.output_strings.push(raw);
        true
    }

    pub fn clear_outputs(&self, cell_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(cell) = inner.cells.iter_mut().find(|c| c.id == cell_id) else {
            return false;
        };
        cell.outputs.clear();
        cell.output_strings.clear();
        true
    }

    pub fn set_execution_count(&self, cell_id: &str, count: i64) -> bool {
        let mut inner = self.lock();
        let Some(cell) = inner.cells.iter_mut().find(|c| c.id == cell_id) else {
            return false;
        };
        cell.execution_count = Some(count);
        true
    }

    /// Rewrite every output whose `transient.display_id` matches. Returns
    /// how many were updated.
    pub fn update_display(&self, display_id: &str, data: &Value, metadata: &Map<String, Value>) -> usize {
        let mut inner = self.lock();
        let mut updated = 0;
        for cell in inner.cells.iter_mut() {
            for (output, raw) in cell.outputs.iter_mut().zip(cell.output_strings.iter_mut()) {
                let CellOutput::Resolved(value) = output else {
                    continue;
                };
                let matches = value
                    .get("transient")
                    .and_then(|t| t.get("display_id"))
                    .and_then(Value::as_str)
                    == Some(display_id);
                if !matches {
                    continue;
                }
                if let Value::Object(map) = value {
                    map.insert("data".into(), data.clone());
                    map.insert("metadata".into(), Value::Object(metadata.clone()));
                }
                *raw = value.to_string();
                updated += 1;
            }
        }
        updated
    }
}

fn pending_outputs(cells: &[CellState]) -> Vec<PendingOutput> {
    let mut pending = Vec::new();
    for cell in cells {
        let mut seen = HashSet::new();
        for output in &cell.outputs {
            if let CellOutput::Pending(hash) = output {
                if seen.insert(hash.as_str()) {
                    pending.push(PendingOutput {
                        cell_id: cell.id.clone(),
                        hash: hash.clone(),
                    });
                }
            }
        }
    }
    pending
}
