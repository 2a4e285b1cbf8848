//! Dependency trust gate in front of kernel launch.
//!
//! A notebook that declares dependencies only gets a kernel once its
//! dependency set carries a valid signature from this machine. Otherwise
//! the launch is parked until the user approves (which signs the current
//! dependencies) or declines. There is no way around the gate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{info, warn};
use runt_trust::{
    check_packages, NotebookMetadata, TrustError, TrustInfo, TrustKey, TyposquatWarning,
};
use runtimed::protocol::{NotebookRequest, NotebookResponse};
use serde::Serialize;

use crate::config::SessionConfig;
use crate::daemon::DaemonRpc;
use crate::error::SessionError;

/// Where trust is verified and approvals are recorded.
#[async_trait]
pub trait TrustBackend: Send + Sync {
    async fn verify(&self) -> Result<TrustInfo, SessionError>;
    async fn approve(&self) -> Result<(), SessionError>;
}

/// The daemon checks the room's metadata with its own key.
pub struct DaemonTrust {
    daemon: Arc<dyn DaemonRpc>,
}

impl DaemonTrust {
    pub fn new(daemon: Arc<dyn DaemonRpc>) -> Self {
        Self { daemon }
    }
}

#[async_trait]
impl TrustBackend for DaemonTrust {
    async fn verify(&self) -> Result<TrustInfo, SessionError> {
        match self.daemon.request(NotebookRequest::VerifyTrust {}).await? {
            NotebookResponse::TrustInfo { info } => Ok(info),
            other => Err(SessionError::unexpected("verify_trust", other)),
        }
    }

    async fn approve(&self) -> Result<(), SessionError> {
        match self.daemon.request(NotebookRequest::ApproveTrust {}).await? {
            NotebookResponse::TrustApproved {} => Ok(()),
            other => Err(SessionError::unexpected("approve_trust", other)),
        }
    }
}

/// Signs notebook metadata held in this process with the local trust key.
#[derive(Clone)]
pub struct LocalTrust {
    key: TrustKey,
    metadata: Arc<Mutex<NotebookMetadata>>,
}

impl LocalTrust {
    pub fn new(key: TrustKey, metadata: NotebookMetadata) -> Self {
        Self {
            key,
            metadata: Arc::new(Mutex::new(metadata)),
        }
    }

    /// Sign with the key at the configured trust key path, generating it
    /// on first use.
    pub fn from_config(
        config: &SessionConfig,
        metadata: NotebookMetadata,
    ) -> Result<Self, SessionError> {
        let path = config.trust_key_path().ok_or(TrustError::NoConfigDir)?;
        let key = TrustKey::load_or_create(&path)?;
        Ok(Self::new(key, metadata))
    }

    pub fn metadata(&self) -> NotebookMetadata {
        self.metadata.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Edit the metadata in place, e.g. to add a dependency.
    pub fn update(&self, edit: impl FnOnce(&mut NotebookMetadata)) {
        edit(&mut self.metadata.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[async_trait]
impl TrustBackend for LocalTrust {
    async fn verify(&self) -> Result<TrustInfo, SessionError> {
        let metadata = self.metadata.lock().unwrap_or_else(|e| e.into_inner());
        Ok(runt_trust::verify_notebook_trust(&metadata, &self.key))
    }

    async fn approve(&self) -> Result<(), SessionError> {
        let mut metadata = self.metadata.lock().unwrap_or_else(|e| e.into_inner());
        runt_trust::approve_notebook(&mut metadata, &self.key)?;
        Ok(())
    }
}

/// Trust status plus look-alike package warnings. Warnings never block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustCheck {
    pub info: TrustInfo,
    pub typosquat_warnings: Vec<TyposquatWarning>,
}

impl TrustCheck {
    pub fn allows_launch(&self) -> bool {
        self.info.status.allows_launch()
    }
}

/// A launch waiting on approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLaunch {
    pub kernel_type: String,
    pub env_source: String,
    pub notebook_path: Option<String>,
}

#[derive(Debug)]
pub enum GateDecision {
    Proceed(TrustCheck),
    Deferred(TrustCheck),
}

#[derive(Default)]
struct GateState {
    last_check: Option<TrustCheck>,
    pending: Option<PendingLaunch>,
}

#[derive(Clone)]
pub struct TrustGate {
    backend: Arc<dyn TrustBackend>,
    state: Arc<Mutex<GateState>>,
}

impl TrustGate {
    pub fn new(backend: Arc<dyn TrustBackend>) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verify the signature and scan dependency names.
    pub async fn check_trust(&self) -> Result<TrustCheck, SessionError> {
        let info = self.backend.verify().await?;
        let typosquat_warnings = check_packages(&info.all_dependencies());
        for warning in &typosquat_warnings {
            warn!(
                "[trust-gate] {:?} looks like {:?} (distance {})",
                warning.package, warning.similar_to, warning.distance
            );
        }
        let check = TrustCheck {
            info,
            typosquat_warnings,
        };
        self.state().last_check = Some(check.clone());
        Ok(check)
    }

    /// Result of the last check, if it is still current.
    pub fn last_check(&self) -> Option<TrustCheck> {
        self.state().last_check.clone()
    }

    /// Forget the last check. The next launch re-verifies.
    pub fn clear_cache(&self) {
        self.state().last_check = None;
    }

    /// Decide whether `launch` may go ahead. If not, it is parked until
    /// [`approve`](Self::approve) or [`decline`](Self::decline).
    pub async fn gate_launch(&self, launch: PendingLaunch) -> Result<GateDecision, SessionError> {
        let check = self.check_trust().await?;
        let mut state = self.state();
        if check.allows_launch() {
            state.pending = None;
            Ok(GateDecision::Proceed(check))
        } else {
            info!(
                "[trust-gate] Holding {} launch: dependencies are {:?}",
                launch.kernel_type, check.info.status
            );
            state.pending = Some(launch);
            Ok(GateDecision::Deferred(check))
        }
    }

    pub fn pending_launch(&self) -> Option<PendingLaunch> {
        self.state().pending.clone()
    }

    /// Record the user's approval, re-verify, and hand back the parked
    /// launch if the notebook is now trusted.
    pub async fn approve(&self) -> Result<(TrustCheck, Option<PendingLaunch>), SessionError> {
        self.backend.approve().await?;
        let check = self.check_trust().await?;
        if !check.allows_launch() {
            warn!(
                "[trust-gate] Still {:?} after approval",
                check.info.status
            );
            return Ok((check, None));
        }
        let pending = self.state().pending.take();
        Ok((check, pending))
    }

    /// The user said no. The parked launch is dropped.
    pub fn decline(&self) {
        if let Some(launch) = self.state().pending.take() {
            info!("[trust-gate] Declined {} launch", launch.kernel_type);
        }
    }

    /// Call after this window changed the notebook's dependencies. A notebook
    /// that was trusted is re-signed so the user's own edit keeps it trusted.
    pub async fn dependencies_modified(&self) -> Result<TrustCheck, SessionError> {
        let was_trusted = matches!(
            self.last_check().map(|c| c.info.status),
            Some(runt_trust::TrustStatus::Trusted)
        );
        if was_trusted {
            self.backend.approve().await?;
        }
        self.check_trust().await
    }
}

#[cfg(test)]
mod tests {
    use runt_trust::TrustStatus;
    use serde_json::json;

    use super::*;

    fn local(deps: &[&str]) -> LocalTrust {
        let mut metadata = NotebookMetadata::new();
        metadata.insert("uv".into(), json!({ "dependencies": deps }));
        LocalTrust::new(TrustKey::from_bytes([3u8; 32]), metadata)
    }

    fn launch() -> PendingLaunch {
        PendingLaunch {
            kernel_type: "python".into(),
            env_source: "uv:inline".into(),
            notebook_path: None,
        }
    }

    #[tokio::test]
    async fn test_untrusted_launch_is_deferred_until_approved() {
        let gate = TrustGate::new(Arc::new(local(&["pandas"])));

        let decision = gate.gate_launch(launch()).await.unwrap();
        assert!(matches!(decision, GateDecision::Deferred(ref c) if c.info.status == TrustStatus::Untrusted));
        assert_eq!(gate.pending_launch(), Some(launch()));

        let (check, resumed) = gate.approve().await.unwrap();
        assert_eq!(check.info.status, TrustStatus::Trusted);
        assert_eq!(resumed, Some(launch()));
        assert_eq!(gate.pending_launch(), None);

        assert!(matches!(
            gate.gate_launch(launch()).await.unwrap(),
            GateDecision::Proceed(_)
        ));
    }

    #[tokio::test]
    async fn test_decline_drops_pending_launch() {
        let gate = TrustGate::new(Arc::new(local(&["pandas"])));
        gate.gate_launch(launch()).await.unwrap();
        gate.decline();
        assert_eq!(gate.pending_launch(), None);
        // Still untrusted.
        assert!(!gate.check_trust().await.unwrap().allows_launch());
    }

    #[tokio::test]
    async fn test_configured_key_signs_across_sessions() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SessionConfig {
            trust_key_path: Some(dir.path().join("runt").join("trust-key")),
            ..SessionConfig::default()
        };
        let metadata = local(&["pandas"]).metadata();

        let first = LocalTrust::from_config(&config, metadata).unwrap();
        first.approve().await.unwrap();
        assert!(dir.path().join("runt").join("trust-key").exists());

        // A later session loads the same key and accepts the signature.
        let second = LocalTrust::from_config(&config, first.metadata()).unwrap();
        assert_eq!(second.verify().await.unwrap().status, TrustStatus::Trusted);

        let other_key = LocalTrust::new(TrustKey::from_bytes([3u8; 32]), first.metadata());
        assert_eq!(
            other_key.verify().await.unwrap().status,
            TrustStatus::SignatureInvalid
        );
    }

    #[tokio::test]
    async fn test_no_dependencies_proceeds() {
        let backend = LocalTrust::new(TrustKey::from_bytes([3u8; 32]), NotebookMetadata::new());
        let gate = TrustGate::new(Arc::new(backend));
        assert!(matches!(
            gate.gate_launch(launch()).await.unwrap(),
            GateDecision::Proceed(ref c) if c.info.status == TrustStatus::NoDependencies
        ));
    }

    #[tokio::test]
    async fn test_typosquat_warnings_do_not_block() {
        let backend = local(&["numppy", "pandas"]);
        let gate = TrustGate::new(Arc::new(backend.clone()));
        gate.approve().await.unwrap();

        let check = gate.check_trust().await.unwrap();
        assert!(check.allows_launch());
        assert_eq!(check.typosquat_warnings.len(), 1);
        assert_eq!(check.typosquat_warnings[0].similar_to, "numpy");
    }

    #[tokio::test]
    async fn test_outside_edit_invalidates_but_own_edit_resigns() {
        let backend = local(&["pandas"]);
        let gate = TrustGate::new(Arc::new(backend.clone()));
        gate.approve().await.unwrap();

        // This window adds a dependency.
        backend.update(|m| {
            m.insert("uv".into(), json!({ "dependencies": ["pandas", "polars"] }));
        });
        let check = gate.dependencies_modified().await.unwrap();
        assert_eq!(check.info.status, TrustStatus::Trusted);

        // Someone else edits the file.
        backend.update(|m| {
            m.insert("uv".into(), json!({ "dependencies": ["pandas", "evil"] }));
        });
        let check = gate.check_trust().await.unwrap();
        assert_eq!(check.info.status, TrustStatus::SignatureInvalid);
        assert!(matches!(
            gate.gate_launch(launch()).await.unwrap(),
            GateDecision::Deferred(_)
        ));
    }

    #[tokio::test]
    async fn test_untrusted_edit_is_not_signed() {
        let backend = local(&["pandas"]);
        let gate = TrustGate::new(Arc::new(backend.clone()));
        gate.check_trust().await.unwrap();

        backend.update(|m| {
            m.insert("uv".into(), json!({ "dependencies": ["pandas", "polars"] }));
        });
        let check = gate.dependencies_modified().await.unwrap();
        assert_eq!(check.info.status, TrustStatus::Untrusted);
    }
}
