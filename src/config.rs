use crate::core::{Result, SyncError};
use crate::storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backoff used by the connectivity trigger while the outbox stays non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First retry delay in milliseconds.
    pub base_backoff_ms: u64,
    /// Upper bound for the exponential delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt (1-based), capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.base_backoff_ms.max(1);
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

/// What the engine does with an entry the Remote Authority rejected for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermanentFailurePolicy {
    /// Move it (and, for a Create, the rest of its lifeline) to the dead-letter list.
    #[default]
    DeadLetter,
    /// Leave it queued; its lifeline stays blocked until someone intervenes.
    Retain,
}

/// Configuration for an offline sync instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory for the journal and snapshot. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// Journal frames between snapshots.
    pub checkpoint_every_ops: usize,

    /// Upper bound for a single remote call.
    pub request_timeout_ms: u64,

    pub retry: RetryPolicy,

    pub permanent_failures: PermanentFailurePolicy,

    /// Treat a 404 on delete as "already gone".
    pub delete_missing_is_success: bool,

    /// Capacity of the sync event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::None,
            checkpoint_every_ops: 256,
            request_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            permanent_failures: PermanentFailurePolicy::default(),
            delete_missing_is_success: true,
            event_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Create a configuration persisting under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            durability: DurabilityMode::default(),
            ..Self::default()
        }
    }

    /// In-memory configuration (nothing survives a restart)
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set durability mode
    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    /// Set checkpoint interval
    pub fn checkpoint_every_ops(mut self, ops: usize) -> Self {
        self.checkpoint_every_ops = ops.max(1);
        self
    }

    /// Set remote call timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Set retry backoff
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set permanent failure handling
    pub fn permanent_failures(mut self, policy: PermanentFailurePolicy) -> Self {
        self.permanent_failures = policy;
        self
    }

    pub fn delete_missing_is_success(mut self, enabled: bool) -> Self {
        self.delete_missing_is_success = enabled;
        self
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    /// Parse from a JSON document; missing keys fall back to defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| SyncError::Config(format!("parse sync config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Config(format!("read sync config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_every_ops == 0 {
            return Err(SyncError::Config(
                "checkpoint_every_ops must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.durability != DurabilityMode::None && self.data_dir.is_none() {
            return Err(SyncError::Config(format!(
                "durability {:?} requires a data_dir",
                self.durability
            )));
        }
        Ok(())
    }
}
