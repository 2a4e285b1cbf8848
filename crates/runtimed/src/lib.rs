//! runtimed - wire contract and client transport for the runtimed daemon.
//!
//! The daemon owns kernels, the execution queue, and a content-addressed
//! blob store. Notebook windows talk to it over a single Unix socket (named
//! pipe on Windows) using length-prefixed binary framing with a
//! channel-based handshake. This crate holds everything a window needs to
//! speak that protocol: socket path resolution, framing, request/response
//! and broadcast types, output manifests, and the notebook sync client.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod client;
pub mod connection;
pub mod notebook_doc;
pub mod notebook_sync_client;
pub mod output_store;
pub mod protocol;

// ============================================================================
// Socket location
// ============================================================================

/// Workspace a development daemon belongs to.
///
/// Only set when `RUNTIMED_DEV=1`. `RUNTIMED_WORKSPACE_PATH` wins, otherwise
/// the enclosing git worktree is used.
pub fn dev_workspace() -> Option<PathBuf> {
    if std::env::var("RUNTIMED_DEV").ok().as_deref() != Some("1") {
        return None;
    }
    if let Some(path) = std::env::var_os("RUNTIMED_WORKSPACE_PATH") {
        return Some(PathBuf::from(path));
    }
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let root = PathBuf::from(String::from_utf8(output.stdout).ok()?.trim());
    root.exists().then_some(root)
}

/// First 12 hex chars of the SHA-256 of `path`.
pub fn workspace_hash(path: &Path) -> String {
    hex::encode(&Sha256::digest(path.to_string_lossy().as_bytes())[..6])
}

/// `~/.cache/runt/`, or `~/.cache/runt/worktrees/{hash}/` for a
/// development daemon.
pub fn daemon_base_dir() -> PathBuf {
    let base = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("runt");
    match dev_workspace() {
        Some(workspace) => base.join("worktrees").join(workspace_hash(&workspace)),
        None => base,
    }
}

#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    daemon_base_dir().join("runtimed.sock")
}

#[cfg(windows)]
pub fn default_socket_path() -> PathBuf {
    match dev_workspace() {
        Some(workspace) => {
            PathBuf::from(format!(r"\\.\pipe\runtimed-{}", workspace_hash(&workspace)))
        }
        None => PathBuf::from(r"\\.\pipe\runtimed"),
    }
}

// ============================================================================
// Types
// ============================================================================

/// Environment types the daemon prewarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvType {
    Uv,
    Conda,
}

impl std::fmt::Display for EnvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvType::Uv => write!(f, "uv"),
            EnvType::Conda => write!(f, "conda"),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub uv_available: usize,
    pub uv_warming: usize,
    pub conda_available: usize,
    pub conda_warming: usize,
    /// Error info for UV pool (if warming is failing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uv_error: Option<PoolError>,
    /// Error info for Conda pool (if warming is failing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_error: Option<PoolError>,
}

impl PoolStats {
    /// The warming error for one pool, if any.
    pub fn error_for(&self, env_type: EnvType) -> Option<&PoolError> {
        match env_type {
            EnvType::Uv => self.uv_error.as_ref(),
            EnvType::Conda => self.conda_error.as_ref(),
        }
    }
}

/// Error information for a pool that is failing to warm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolError {
    /// Human-readable error message.
    pub message: String,
    /// Package that failed to install (if identified).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_package: Option<String>,
    /// Number of consecutive failures.
    pub consecutive_failures: u32,
    /// Seconds until next retry (0 if retry is imminent).
    pub retry_in_secs: u64,
}
