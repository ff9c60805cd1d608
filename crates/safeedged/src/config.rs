//! safeedged.toml configuration.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use safeedge_rollout::{EngineConfig, RetryPolicy, TrustedKeys};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub rollout: RolloutConfig,
    pub trusted_keys: Vec<TrustedKeyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: PathBuf::from("/var/lib/safeedge"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub heartbeat_interval_secs: u64,
    pub offline_after_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            offline_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub reconcile_interval_secs: u64,
    pub send_timeout_ms: u64,
    pub default_apply_timeout_secs: u64,
    pub rollback_timeout_secs: u64,
    pub stuck_after_secs: u64,
    pub write_retry_max_attempts: u32,
    pub write_retry_base_ms: u64,
    pub write_retry_max_ms: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 10,
            send_timeout_ms: 2000,
            default_apply_timeout_secs: 900,
            rollback_timeout_secs: 300,
            stuck_after_secs: 3600,
            write_retry_max_attempts: 5,
            write_retry_base_ms: 1000,
            write_retry_max_ms: 60_000,
        }
    }
}

impl RolloutConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// One `[[trusted_keys]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKeyConfig {
    pub key_id: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Read `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let r = &self.rollout;
        EngineConfig {
            default_apply_timeout: Duration::from_secs(r.default_apply_timeout_secs),
            rollback_timeout: Duration::from_secs(r.rollback_timeout_secs),
            stuck_after: Duration::from_secs(r.stuck_after_secs),
            retry: RetryPolicy {
                max_attempts: r.write_retry_max_attempts.max(1),
                base: Duration::from_millis(r.write_retry_base_ms),
                max: Duration::from_millis(r.write_retry_max_ms),
            },
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.liveness.heartbeat_interval_secs)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.liveness.offline_after_secs)
    }

    /// Build the trusted key set. A malformed key fails startup.
    pub fn trusted_keys(&self) -> anyhow::Result<TrustedKeys> {
        let mut keys = TrustedKeys::new();
        for entry in &self.trusted_keys {
            keys.insert_hex(&entry.key_id, &entry.public_key)
                .map_err(|e| anyhow::anyhow!("trusted key {}: {e}", entry.key_id))?;
        }
        Ok(keys)
    }
}
