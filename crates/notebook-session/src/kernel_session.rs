//! Kernel status as one window sees it.
//!
//! The daemon owns the kernel. This tracks the last status it reported,
//! plus optimistic transitions for the window's own launch and shutdown
//! requests. Whatever the daemon says next wins.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use runtimed::protocol::{NotebookRequest, NotebookResponse};
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::daemon::DaemonRpc;
use crate::error::SessionError;
use crate::trust_gate::{PendingLaunch, TrustCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    #[default]
    NotStarted,
    Starting,
    Idle,
    Busy,
    Error,
    Shutdown,
}

impl KernelStatus {
    /// Parse a status string from the daemon.
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "not_started" => Some(KernelStatus::NotStarted),
            "starting" => Some(KernelStatus::Starting),
            "idle" => Some(KernelStatus::Idle),
            "busy" => Some(KernelStatus::Busy),
            "error" => Some(KernelStatus::Error),
            "shutdown" => Some(KernelStatus::Shutdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelStatus::NotStarted => "not_started",
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Error => "error",
            KernelStatus::Shutdown => "shutdown",
        }
    }

    /// Whether a launch request makes sense from this status.
    pub fn can_launch(&self) -> bool {
        matches!(
            self,
            KernelStatus::NotStarted | KernelStatus::Shutdown | KernelStatus::Error
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, KernelStatus::Idle | KernelStatus::Busy)
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus what the daemon reported launching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelInfo {
    pub status: KernelStatus,
    pub kernel_type: Option<String>,
    pub env_source: Option<String>,
}

/// Result of asking for a kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    Launched {
        kernel_type: String,
        env_source: String,
    },
    AlreadyRunning {
        kernel_type: String,
        env_source: String,
    },
    /// Held back until the user approves the notebook's dependencies.
    AwaitingApproval(TrustCheck),
}

#[derive(Clone)]
pub struct KernelSession {
    daemon: Arc<dyn DaemonRpc>,
    info: Arc<Mutex<KernelInfo>>,
}

impl KernelSession {
    pub fn new(daemon: Arc<dyn DaemonRpc>) -> Self {
        Self {
            daemon,
            info: Arc::new(Mutex::new(KernelInfo::default())),
        }
    }

    pub fn info(&self) -> KernelInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> KernelStatus {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    fn set_status(&self, status: KernelStatus) -> KernelStatus {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        let previous = info.status;
        if previous != status {
            debug!("[kernel-session] {} -> {}", previous, status);
        }
        info.status = status;
        previous
    }

    /// Apply a `kernel_status` broadcast. Unknown strings are ignored.
    pub fn apply_status(&self, status: &str) -> Option<KernelStatus> {
        match KernelStatus::from_wire(status) {
            Some(parsed) => {
                self.set_status(parsed);
                Some(parsed)
            }
            None => {
                warn!("[kernel-session] Ignoring unknown kernel status {:?}", status);
                None
            }
        }
    }

    /// Apply a `kernel_error` broadcast.
    pub fn apply_error(&self, error: &str) {
        warn!("[kernel-session] Kernel error: {}", error);
        self.set_status(KernelStatus::Error);
    }

    /// Back to the state of a window that has never seen a kernel.
    pub fn reset(&self) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = KernelInfo::default();
    }

    /// Ask the daemon for a kernel. Callers go through the trust gate first.
    pub async fn launch(&self, launch: &PendingLaunch) -> Result<LaunchOutcome, SessionError> {
        let previous = {
            let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
            let previous = info.status;
            if previous.can_launch() {
                info.status = KernelStatus::Starting;
            }
            previous
        };

        info!(
            "[kernel-session] Launching {} kernel ({})",
            launch.kernel_type, launch.env_source
        );
        let response = self
            .daemon
            .request(NotebookRequest::LaunchKernel {
                kernel_type: launch.kernel_type.clone(),
                env_source: launch.env_source.clone(),
                notebook_path: launch.notebook_path.clone(),
            })
            .await;

        let (kernel_type, env_source, already_running) = match response {
            Ok(NotebookResponse::KernelLaunched {
                kernel_type,
                env_source,
            }) => (kernel_type, env_source, false),
            Ok(NotebookResponse::KernelAlreadyRunning {
                kernel_type,
                env_source,
            }) => (kernel_type, env_source, true),
            Ok(other) => {
                self.restore_if(KernelStatus::Starting, previous);
                return Err(SessionError::unexpected("launch_kernel", other));
            }
            Err(e) => {
                self.restore_if(KernelStatus::Starting, previous);
                return Err(e);
            }
        };

        {
            let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
            info.kernel_type = Some(kernel_type.clone());
            info.env_source = Some(env_source.clone());
        }

        if !already_running {
            return Ok(LaunchOutcome::Launched {
                kernel_type,
                env_source,
            });
        }

        // An already running kernel won't announce itself again.
        if let Err(e) = self.refresh_once().await {
            warn!("[kernel-session] Kernel info after launch failed: {}", e);
        }
        Ok(LaunchOutcome::AlreadyRunning {
            kernel_type,
            env_source,
        })
    }

    /// Undo an optimistic `intent` unless a broadcast already replaced it.
    fn restore_if(&self, intent: KernelStatus, previous: KernelStatus) {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        if info.status == intent {
            info.status = previous;
        }
    }

    /// Request shutdown. The window shows "not started" right away; if the
    /// request fails the previous status comes back.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let previous = self.set_status(KernelStatus::NotStarted);
        let result = match self.daemon.request(NotebookRequest::ShutdownKernel {}).await {
            Ok(NotebookResponse::KernelShuttingDown {} | NotebookResponse::NoKernel {}) => return Ok(()),
            Ok(other) => Err(SessionError::unexpected("shutdown_kernel", other)),
            Err(e) => Err(e),
        };
        self.restore_if(KernelStatus::NotStarted, previous);
        result
    }

    /// Interrupt the running cell. Returns false if there was no kernel.
    /// Status is left for the daemon to report.
    pub async fn interrupt(&self) -> Result<bool, SessionError> {
        match self
            .daemon
            .request(NotebookRequest::InterruptExecution {})
            .await?
        {
            NotebookResponse::InterruptSent {} => Ok(true),
            NotebookResponse::NoKernel {} => Ok(false),
            other => Err(SessionError::unexpected("interrupt_execution", other)),
        }
    }

    /// One `get_kernel_info` round trip, applied as-is.
    pub async fn refresh_once(&self) -> Result<KernelStatus, SessionError> {
        let (status, kernel_type, env_source) = self.query_info().await?;
        self.apply_info(status, kernel_type, env_source);
        Ok(status)
    }

    /// Re-query kernel info after (re)connecting.
    ///
    /// Right after a daemon restart a kernel may not be registered yet, so a
    /// `not_started` answer is retried until `policy` runs out. The last
    /// answer is accepted whatever it is.
    pub async fn refresh_info(&self, policy: RetryPolicy) -> Result<KernelStatus, SessionError> {
        let attempts = policy.attempts();
        let mut attempt = 0;
        loop {
            let last_attempt = attempt + 1 >= attempts;
            match self.query_info().await {
                Ok((KernelStatus::NotStarted, _, _)) if !last_attempt => {
                    debug!(
                        "[kernel-session] No kernel yet (attempt {}/{})",
                        attempt + 1,
                        attempts
                    );
                }
                Ok((status, kernel_type, env_source)) => {
                    self.apply_info(status, kernel_type, env_source);
                    return Ok(status);
                }
                Err(e) if last_attempt => return Err(e),
                Err(e) => {
                    debug!("[kernel-session] Kernel info failed: {}", e);
                }
            }
            tokio::time::sleep(policy.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    async fn query_info(
        &self,
    ) -> Result<(KernelStatus, Option<String>, Option<String>), SessionError> {
        match self.daemon.request(NotebookRequest::GetKernelInfo {}).await? {
            NotebookResponse::KernelInfo {
                kernel_type,
                env_source,
                status,
            } => {
                let parsed = KernelStatus::from_wire(&status).unwrap_or_else(|| {
                    warn!("[kernel-session] Unknown kernel status {:?}", status);
                    KernelStatus::NotStarted
                });
                Ok((parsed, kernel_type, env_source))
            }
            other => Err(SessionError::unexpected("get_kernel_info", other)),
        }
    }

    fn apply_info(
        &self,
        status: KernelStatus,
        kernel_type: Option<String>,
        env_source: Option<String>,
    ) {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        info.status = status;
        info.kernel_type = kernel_type;
        info.env_source = env_source;
    }
}
