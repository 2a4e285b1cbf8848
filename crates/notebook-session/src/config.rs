//! Session configuration.
//!
//! Stored as JSON in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-notebook/session.json
//! - Linux: ~/.config/runt-notebook/session.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-notebook\session.json
//!
//! Every field is optional; missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Environment variable that overrides the daemon socket path.
pub const SOCKET_PATH_ENV: &str = "RUNTIMED_SOCKET_PATH";

/// Bounded retry: `attempts` tries, waiting `delay_ms * multiplier^n`
/// after the n-th failure. A multiplier of 1 is a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(200))
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
            multiplier: 1,
        }
    }

    pub fn exponential(attempts: u32, delay: Duration, multiplier: u32) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
            multiplier,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt);
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }

    /// At least one attempt, whatever the config says.
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Daemon socket (named pipe on Windows).
    pub socket_path: PathBuf,

    pub connect_timeout_ms: u64,

    /// Kernel info refresh after (re)connecting.
    pub kernel_info_retry: RetryPolicy,

    /// Blob port lookups on the blob channel.
    pub blob_port_retry: RetryPolicy,

    /// Reconnecting after the daemon connection drops.
    pub reconnect_retry: RetryPolicy,

    pub default_kernel_type: String,

    pub default_env_source: String,

    /// Trust key location; `<config_dir>/runt/trust-key` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_key_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_path: runtimed::default_socket_path(),
            connect_timeout_ms: 2000,
            kernel_info_retry: RetryPolicy::fixed(5, Duration::from_millis(500)),
            blob_port_retry: RetryPolicy::exponential(3, Duration::from_millis(200), 2),
            reconnect_retry: RetryPolicy::fixed(10, Duration::from_secs(1)),
            default_kernel_type: "python".to_string(),
            default_env_source: "uv:prewarmed".to_string(),
            trust_key_path: None,
        }
    }
}

impl SessionConfig {
    /// `<config_dir>/runt-notebook/session.json`
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("runt-notebook").join("session.json"))
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Self {
        let config = match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        };
        config.with_env_overrides()
    }

    /// Load from `path`. A missing file gives defaults; an unreadable or
    /// invalid one gives defaults with a warning.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("[session-config] Could not read {:?}: {}", path, e);
                return Self::default();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("[session-config] Ignoring invalid {:?}: {}", path, e);
            Self::default()
        })
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(path) = std::env::var_os(SOCKET_PATH_ENV) {
            if !path.is_empty() {
                self.socket_path = PathBuf::from(path);
            }
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn trust_key_path(&self) -> Option<PathBuf> {
        self.trust_key_path
            .clone()
            .or_else(runt_trust::TrustKey::default_path)
    }
}
