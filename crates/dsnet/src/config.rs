//! Node configuration.
//!
//! The config is usually loaded from a JSON file with [`NodeConfig::load`].
//! Every section has a [`Default`], and fields missing from the file take
//! their default, so `{}` is a valid config.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dsnet_dsync::{PolicyConfig, RetryPolicy};

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Owner name written into the datasets this node creates.
    pub username: String,
    /// What this node accepts from pushers.
    pub policy: PolicyConfig,
    /// Client-side sync behaviour.
    pub sync: SyncConfig,
    /// Named peers this node pushes to and pulls from.
    pub remotes: BTreeMap<String, RemoteConfig>,
    pub gc: GcConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            username: "anonymous".into(),
            policy: PolicyConfig::default(),
            sync: SyncConfig::default(),
            remotes: BTreeMap::new(),
            gc: GcConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load the config from a JSON file. A missing file gives the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<NodeConfig> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(NodeConfig::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&s)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Register a remote under `name`.
    pub fn with_remote(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.remotes.insert(
            name.into(),
            RemoteConfig {
                address: address.into(),
            },
        );
        self
    }
}

/// Client-side sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bound on any single request (ms).
    pub request_timeout_ms: u64,
    /// Bound on a whole push or pull (ms).
    pub sync_timeout_ms: u64,
    /// Backoff for idempotent requests that fail in transport.
    pub retry: RetryPolicy,
    /// Blocks per delete batch during garbage collection.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            sync_timeout_ms: 600_000,
            retry: RetryPolicy::default(),
            batch_size: 256,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// A peer as the transport addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub address: String,
}

/// Garbage collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Treat every committed path in the logbook as live, not just heads.
    pub keep_history: bool,
    /// Report what would be swept without deleting anything.
    pub dry_run: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            keep_history: true,
            dry_run: false,
        }
    }
}
