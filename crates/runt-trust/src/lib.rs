//! Notebook trust verification using HMAC signatures over dependency metadata.
//!
//! Notebooks can declare package dependencies that get installed with full
//! OS permissions when a kernel starts. We sign only the dependency fields
//! (`uv` and `conda`) with a per-machine key, so editing cells keeps a
//! notebook trusted while an outside change to its dependencies needs
//! re-approval.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

pub mod typosquat;

pub use typosquat::{check_packages, check_typosquat, TyposquatWarning};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "hmac-sha256:";

/// Notebook-level metadata, keyed by top-level field (`uv`, `conda`, `runt`, ...).
pub type NotebookMetadata = HashMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("trust key file is corrupted (expected 32 bytes, found {0})")]
    CorruptKey(usize),

    #[error("trust key I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid HMAC key")]
    InvalidKey,
}

/// Result of verifying a notebook's trust status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    /// Valid signature matching the current dependencies.
    Trusted,
    /// No signature (new or external notebook).
    Untrusted,
    /// A signature that doesn't match the current dependencies.
    SignatureInvalid,
    /// No dependencies configured, nothing to check.
    NoDependencies,
}

impl TrustStatus {
    /// Whether a kernel may launch without asking the user.
    pub fn allows_launch(self) -> bool {
        matches!(self, TrustStatus::Trusted | TrustStatus::NoDependencies)
    }
}

/// Trust status plus the dependencies that would be installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustInfo {
    pub status: TrustStatus,
    #[serde(default)]
    pub uv_dependencies: Vec<String>,
    #[serde(default)]
    pub conda_dependencies: Vec<String>,
    #[serde(default)]
    pub conda_channels: Vec<String>,
}

impl TrustInfo {
    /// Every declared dependency, uv first.
    pub fn all_dependencies(&self) -> Vec<String> {
        self.uv_dependencies
            .iter()
            .chain(self.conda_dependencies.iter())
            .cloned()
            .collect()
    }
}

/// Per-machine HMAC key. Generated on first use; never leaves the machine.
#[derive(Clone)]
pub struct TrustKey([u8; 32]);

impl std::fmt::Debug for TrustKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrustKey(..)")
    }
}

impl TrustKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// `<config_dir>/runt/trust-key`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("runt").join("trust-key"))
    }

    /// Load the key at the default path, creating it if missing.
    pub fn load_default() -> Result<Self, TrustError> {
        let path = Self::default_path().ok_or(TrustError::NoConfigDir)?;
        Self::load_or_create(&path)
    }

    /// Load the key at `path`, generating and writing a fresh one if the
    /// file does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, TrustError> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| TrustError::CorruptKey(bytes.len()))?;
            return Ok(Self(key));
        }

        let key: [u8; 32] = rand::random();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, key)?;
        Ok(Self(key))
    }

    fn mac(&self, metadata: &NotebookMetadata) -> Result<HmacSha256, TrustError> {
        let mut mac = HmacSha256::new_from_slice(&self.0).map_err(|_| TrustError::InvalidKey)?;
        mac.update(signable_content(metadata).as_bytes());
        Ok(mac)
    }

    /// Signature over the dependency metadata, `hmac-sha256:<hex>`.
    pub fn sign(&self, metadata: &NotebookMetadata) -> Result<String, TrustError> {
        let result = self.mac(metadata)?.finalize();
        Ok(format!(
            "{}{}",
            SIGNATURE_PREFIX,
            hex::encode(result.into_bytes())
        ))
    }

    /// Constant-time check of `signature` against the current dependencies.
    pub fn verify(&self, metadata: &NotebookMetadata, signature: &str) -> bool {
        let Some(expected_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
            return false;
        };
        let Ok(expected) = hex::decode(expected_hex) else {
            return false;
        };
        match self.mac(metadata) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

/// Canonical JSON of the `uv` and `conda` fields. serde_json maps are
/// key-sorted, so equal metadata always yields equal bytes.
fn signable_content(metadata: &NotebookMetadata) -> String {
    let mut signable = serde_json::Map::new();
    for key in ["uv", "conda"] {
        if let Some(value) = metadata.get(key) {
            signable.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(signable).to_string()
}

fn string_list(metadata: &NotebookMetadata, section: &str, field: &str) -> Vec<String> {
    metadata
        .get(section)
        .and_then(|v| v.get(field))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Check if a notebook has any dependencies configured.
pub fn has_dependencies(metadata: &NotebookMetadata) -> bool {
    !string_list(metadata, "uv", "dependencies").is_empty()
        || !string_list(metadata, "conda", "dependencies").is_empty()
}

/// The stored signature, if any.
pub fn stored_signature(metadata: &NotebookMetadata) -> Option<&str> {
    metadata
        .get("runt")
        .and_then(|v| v.get("trust_signature"))
        .and_then(|v| v.as_str())
}

/// Verify the trust status of a notebook against `key`.
pub fn verify_notebook_trust(metadata: &NotebookMetadata, key: &TrustKey) -> TrustInfo {
    let uv_dependencies = string_list(metadata, "uv", "dependencies");
    let conda_dependencies = string_list(metadata, "conda", "dependencies");
    let conda_channels = string_list(metadata, "conda", "channels");

    let status = if !has_dependencies(metadata) {
        TrustStatus::NoDependencies
    } else {
        match stored_signature(metadata) {
            None => TrustStatus::Untrusted,
            Some(sig) if key.verify(metadata, sig) => TrustStatus::Trusted,
            Some(_) => TrustStatus::SignatureInvalid,
        }
    };

    TrustInfo {
        status,
        uv_dependencies,
        conda_dependencies,
        conda_channels,
    }
}

/// Sign the current dependencies and store the signature and an RFC 3339
/// timestamp under `metadata["runt"]`. Other `runt` fields are kept.
pub fn approve_notebook(metadata: &mut NotebookMetadata, key: &TrustKey) -> Result<String, TrustError> {
    let signature = key.sign(metadata)?;
    let runt = metadata
        .entry("runt".to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !runt.is_object() {
        *runt = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = runt {
        map.insert("trust_signature".into(), Value::String(signature.clone()));
        map.insert(
            "trust_timestamp".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn test_key() -> TrustKey {
        TrustKey::from_bytes([7u8; 32])
    }

    fn make_test_metadata(uv_deps: &[&str], conda_deps: &[&str]) -> NotebookMetadata {
        let mut metadata = HashMap::new();
        if !uv_deps.is_empty() {
            metadata.insert(
                "uv".to_string(),
                serde_json::json!({ "dependencies": uv_deps }),
            );
        }
        if !conda_deps.is_empty() {
            metadata.insert(
                "conda".to_string(),
                serde_json::json!({
                    "dependencies": conda_deps,
                    "channels": ["conda-forge"],
                }),
            );
        }
        metadata
    }

    #[test]
    fn test_no_dependencies() {
        let info = verify_notebook_trust(&HashMap::new(), &test_key());
        assert_eq!(info.status, TrustStatus::NoDependencies);
        assert!(info.status.allows_launch());
    }

    #[test]
    fn test_unsigned_notebook_is_untrusted() {
        let metadata = make_test_metadata(&["pandas"], &[]);
        let info = verify_notebook_trust(&metadata, &test_key());
        assert_eq!(info.status, TrustStatus::Untrusted);
        assert_eq!(info.uv_dependencies, vec!["pandas"]);
        assert!(!info.status.allows_launch());
    }

    #[test]
    fn test_approve_then_trusted() {
        let mut metadata = make_test_metadata(&["pandas", "numpy"], &["scipy"]);
        let signature = approve_notebook(&mut metadata, &test_key()).unwrap();
        assert!(signature.starts_with("hmac-sha256:"));
        assert_eq!(stored_signature(&metadata), Some(signature.as_str()));
        assert!(metadata["runt"]["trust_timestamp"].is_string());

        let info = verify_notebook_trust(&metadata, &test_key());
        assert_eq!(info.status, TrustStatus::Trusted);
        assert_eq!(info.conda_channels, vec!["conda-forge"]);
    }

    #[test]
    fn test_modified_deps_invalidates_signature() {
        let mut metadata = make_test_metadata(&["pandas"], &[]);
        approve_notebook(&mut metadata, &test_key()).unwrap();

        metadata.insert(
            "uv".to_string(),
            serde_json::json!({ "dependencies": ["pandas", "malicious-pkg"] }),
        );
        let info = verify_notebook_trust(&metadata, &test_key());
        assert_eq!(info.status, TrustStatus::SignatureInvalid);
    }

    #[test]
    fn test_signature_from_other_machine_is_invalid() {
        let mut metadata = make_test_metadata(&["pandas"], &[]);
        approve_notebook(&mut metadata, &TrustKey::from_bytes([9u8; 32])).unwrap();
        let info = verify_notebook_trust(&metadata, &test_key());
        assert_eq!(info.status, TrustStatus::SignatureInvalid);
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let metadata = make_test_metadata(&["pandas"], &[]);
        assert!(!test_key().verify(&metadata, "sha1:abcd"));
        assert!(!test_key().verify(&metadata, "hmac-sha256:not-hex"));
    }

    #[test]
    fn test_approve_keeps_other_runt_fields() {
        let mut metadata = make_test_metadata(&["pandas"], &[]);
        metadata.insert(
            "runt".to_string(),
            serde_json::json!({ "env_id": "abc" }),
        );
        approve_notebook(&mut metadata, &test_key()).unwrap();
        assert_eq!(metadata["runt"]["env_id"], "abc");
    }

    #[test]
    fn test_key_created_then_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("trust-key");

        let first = TrustKey::load_or_create(&path).unwrap();
        let second = TrustKey::load_or_create(&path).unwrap();
        let metadata = make_test_metadata(&["pandas"], &[]);
        assert_eq!(first.sign(&metadata).unwrap(), second.sign(&metadata).unwrap());
    }

    #[test]
    fn test_corrupt_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust-key");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            TrustKey::load_or_create(&path),
            Err(TrustError::CorruptKey(5))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_default_key_lives_under_config_dir() {
        let dir = TempDir::new().unwrap();
        let previous = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", dir.path());

        let path = TrustKey::default_path().unwrap();
        assert_eq!(path, dir.path().join("runt").join("trust-key"));
        TrustKey::load_default().unwrap();
        assert!(path.exists());

        match previous {
            Some(v) => std::env::set_var("XDG_CONFIG_HOME", v),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }

    #[test]
    fn test_trust_info_serialization() {
        let info = TrustInfo {
            status: TrustStatus::NoDependencies,
            uv_dependencies: vec![],
            conda_dependencies: vec![],
            conda_channels: vec![],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "no_dependencies");
    }
}
