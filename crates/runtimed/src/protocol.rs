//! Protocol types for the notebook sync and blob channels.
//!
//! Request, response and broadcast enums are serialized as JSON and sent
//! as typed frames on the notebook sync channel (see `connection.rs`).
//! Blob channel messages are plain JSON frames.

use runt_trust::TrustInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::PoolStats;

/// Requests a notebook window sends to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotebookRequest {
    /// Launch a kernel for this notebook's room.
    LaunchKernel {
        kernel_type: String,
        env_source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notebook_path: Option<String>,
    },
    /// Queue a cell for execution. The daemon reads the source from the doc.
    ExecuteCell { cell_id: String },
    /// Drop every pending (not yet executing) queue entry.
    CancelQueue {},
    /// Queue every code cell in document order.
    RunAllCells {},
    /// Clear a cell's outputs in the shared doc.
    ClearOutputs { cell_id: String },
    /// Interrupt the currently executing cell.
    InterruptExecution {},
    /// Shut the kernel down.
    ShutdownKernel {},
    /// Current executing + pending cells.
    GetQueueState {},
    /// Kernel type, env source and status.
    GetKernelInfo {},
    /// Forward a comm message (widgets) to the kernel.
    SendComm { message: Value },
    /// Record whether a cell is running in the shared doc.
    SetCellRunning { cell_id: String, running: bool },
    /// Verify the notebook's dependency signature.
    VerifyTrust {},
    /// Sign the notebook's current dependency set.
    ApproveTrust {},
    /// Prewarmed pool statistics, including warming errors.
    GetPoolStatus {},
}

/// Responses from the daemon, delivered in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NotebookResponse {
    KernelLaunched {
        kernel_type: String,
        env_source: String,
    },
    KernelAlreadyRunning {
        kernel_type: String,
        env_source: String,
    },
    CellQueued {
        cell_id: String,
    },
    QueueCancelled {
        cell_ids: Vec<String>,
    },
    AllCellsQueued {
        cell_ids: Vec<String>,
    },
    OutputsCleared {
        cell_id: String,
    },
    InterruptSent {},
    KernelShuttingDown {},
    NoKernel {},
    QueueState {
        #[serde(default)]
        executing: Option<String>,
        #[serde(default)]
        queued: Vec<String>,
    },
    KernelInfo {
        #[serde(default)]
        kernel_type: Option<String>,
        #[serde(default)]
        env_source: Option<String>,
        status: String,
    },
    TrustInfo {
        info: TrustInfo,
    },
    TrustApproved {},
    PoolStatus {
        stats: PoolStats,
    },
    Ok {},
    Error {
        error: String,
    },
}

/// Snapshot of one open comm, sent to late joiners in `CommSync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommSnapshot {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub state: Value,
}

/// Events the daemon pushes to every window in a notebook room.
///
/// Tags the window does not know decode to `Unknown` so a newer daemon can
/// add events without breaking older windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotebookBroadcast {
    /// Kernel status: "starting", "idle", "busy", "error", "shutdown".
    KernelStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cell_id: Option<String>,
    },
    ExecutionStarted {
        cell_id: String,
        execution_count: i64,
    },
    /// `output_json` is either inline Jupyter output JSON or a 64-hex
    /// manifest hash.
    Output {
        cell_id: String,
        output_type: String,
        output_json: String,
    },
    DisplayUpdate {
        display_id: String,
        data: Value,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    ExecutionDone {
        cell_id: String,
    },
    QueueChanged {
        #[serde(default)]
        executing: Option<String>,
        #[serde(default)]
        queued: Vec<String>,
    },
    KernelError {
        error: String,
    },
    OutputsCleared {
        cell_id: String,
    },
    Comm {
        msg_type: String,
        content: Value,
        #[serde(default)]
        buffers: Vec<Vec<u8>>,
    },
    CommSync {
        comms: Vec<CommSnapshot>,
    },
    /// Environment preparation progress. `phase` is passed through as-is.
    EnvProgress {
        env_type: String,
        phase: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Blob channel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BlobRequest {
    /// Query the blob HTTP server port.
    GetPort,
}

/// Blob channel response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlobResponse {
    /// Blob server port.
    Port { port: u16 },
    /// An error occurred.
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = NotebookRequest::ExecuteCell {
            cell_id: "c1".into(),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "execute_cell", "cell_id": "c1"})
        );

        let req = NotebookRequest::CancelQueue {};
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "cancel_queue"})
        );
    }

    #[test]
    fn test_launch_kernel_omits_missing_path() {
        let req = NotebookRequest::LaunchKernel {
            kernel_type: "python".into(),
            env_source: "uv:prewarmed".into(),
            notebook_path: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("notebook_path").is_none());
    }

    #[test]
    fn test_response_decodes() {
        let resp: NotebookResponse = serde_json::from_value(json!({
            "result": "queue_cancelled",
            "cell_ids": ["b", "c"]
        }))
        .unwrap();
        assert_eq!(
            resp,
            NotebookResponse::QueueCancelled {
                cell_ids: vec!["b".into(), "c".into()]
            }
        );

        let resp: NotebookResponse = serde_json::from_value(json!({
            "result": "kernel_info",
            "status": "not_started"
        }))
        .unwrap();
        assert_eq!(
            resp,
            NotebookResponse::KernelInfo {
                kernel_type: None,
                env_source: None,
                status: "not_started".into()
            }
        );
    }

    #[test]
    fn test_broadcast_decodes_known_events() {
        let event: NotebookBroadcast = serde_json::from_value(json!({
            "event": "queue_changed",
            "executing": "a",
            "queued": ["b"]
        }))
        .unwrap();
        assert_eq!(
            event,
            NotebookBroadcast::QueueChanged {
                executing: Some("a".into()),
                queued: vec!["b".into()]
            }
        );

        let event: NotebookBroadcast = serde_json::from_value(json!({
            "event": "kernel_status",
            "status": "busy"
        }))
        .unwrap();
        assert_eq!(
            event,
            NotebookBroadcast::KernelStatus {
                status: "busy".into(),
                cell_id: None
            }
        );
    }

    #[test]
    fn test_broadcast_unknown_event() {
        let event: NotebookBroadcast = serde_json::from_value(json!({
            "event": "presence_changed",
            "peers": 3
        }))
        .unwrap();
        assert_eq!(event, NotebookBroadcast::Unknown);
    }

    #[test]
    fn test_broadcast_malformed_known_event_fails() {
        let result = serde_json::from_value::<NotebookBroadcast>(json!({
            "event": "execution_started",
            "cell_id": "a"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_blob_response_untagged() {
        let resp: BlobResponse = serde_json::from_str(r#"{"port": 51234}"#).unwrap();
        assert!(matches!(resp, BlobResponse::Port { port: 51234 }));

        let resp: BlobResponse = serde_json::from_str(r#"{"error": "not running"}"#).unwrap();
        assert!(matches!(resp, BlobResponse::Error { .. }));

        let req = serde_json::to_string(&BlobRequest::GetPort).unwrap();
        assert_eq!(req, r#"{"action":"get_port"}"#);
    }
}
