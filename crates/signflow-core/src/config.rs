//! Engine configuration
//!
//! Loaded from TOML; every section has defaults so an empty file is valid.

use crate::error::{Result, SignflowError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignflowConfig {
    /// Document lock settings
    pub guard: GuardConfig,
    /// Key lifecycle settings
    pub keys: KeyConfig,
    /// Notification delivery settings
    pub notify: NotifyConfig,
    /// Workflow limits
    pub workflow: WorkflowConfig,
}

/// Document lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// How long a transition waits for the document lock
    pub lock_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
        }
    }
}

/// Key lifecycle settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Grace period before a retired key is purged
    pub default_grace_secs: u64,
    /// Interval between purge sweeps
    pub sweep_interval_ms: u64,
    /// Durable purge queue location; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_queue_path: Option<PathBuf>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            default_grace_secs: 30,
            sweep_interval_ms: 1_000,
            purge_queue_path: None,
        }
    }
}

/// Notification delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Bounded channel capacity; events beyond it are dropped
    pub channel_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

/// Workflow limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum TEXT field body
    pub max_text_bytes: usize,
    /// Audit entries kept in memory; unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_max_entries: Option<usize>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_text_bytes: 4_096,
            audit_max_entries: None,
        }
    }
}

impl SignflowConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SignflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SignflowError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.guard.lock_timeout_ms == 0 {
            return Err(SignflowError::Config("guard.lock_timeout_ms must be > 0".into()));
        }
        if self.keys.sweep_interval_ms == 0 {
            return Err(SignflowError::Config("keys.sweep_interval_ms must be > 0".into()));
        }
        if self.notify.channel_capacity == 0 {
            return Err(SignflowError::Config("notify.channel_capacity must be > 0".into()));
        }
        if self.workflow.max_text_bytes == 0 {
            return Err(SignflowError::Config("workflow.max_text_bytes must be > 0".into()));
        }
        if self.workflow.audit_max_entries == Some(0) {
            return Err(SignflowError::Config("workflow.audit_max_entries must be > 0".into()));
        }
        Ok(())
    }

    /// With lock timeout
    #[inline]
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.guard.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With key grace period
    #[inline]
    #[must_use]
    pub fn with_grace_secs(mut self, secs: u64) -> Self {
        self.keys.default_grace_secs = secs;
        self
    }

    /// With durable purge queue
    #[inline]
    #[must_use]
    pub fn with_purge_queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.keys.purge_queue_path = Some(path.into());
        self
    }

    /// Lock timeout as a duration
    #[inline]
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.guard.lock_timeout_ms)
    }

    /// Sweep interval as a duration
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.keys.sweep_interval_ms)
    }
}
