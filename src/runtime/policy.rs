use crate::core::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durability mode for journal appends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RuntimeDurabilityMode {
    /// Appends are flushed to disk before acknowledging success (fsync).
    #[default]
    Strict,
    /// Appends are acknowledged once written, fsync runs at most every `sync_interval_ms`.
    Eventual { sync_interval_ms: u64 },
}

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRetryPolicy {
    /// Maximum number of attempts per journal append.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RuntimeRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RuntimeRetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Bounds how many work items (mailbox drains, orchestration turns) run at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeBackpressurePolicy {
    pub max_inflight: usize,
    /// Timeout in milliseconds to wait for a slot before the item is re-queued.
    pub acquire_timeout_ms: u64,
}

impl Default for RuntimeBackpressurePolicy {
    fn default() -> Self {
        Self {
            max_inflight: 64,
            acquire_timeout_ms: 2_000,
        }
    }
}

/// When snapshots are written and the journal compacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshotPolicy {
    /// Write a snapshot after this many committed records (0 disables).
    pub snapshot_every_ops: usize,
    /// Also snapshot when the journal grows past this many bytes.
    pub compact_if_journal_exceeds_bytes: u64,
}

impl Default for RuntimeSnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_every_ops: 128,
            compact_if_journal_exceeds_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Operational policy for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeOperationalPolicy {
    #[serde(default)]
    pub durability: RuntimeDurabilityMode,
    #[serde(default)]
    pub retry: RuntimeRetryPolicy,
    #[serde(default)]
    pub backpressure: RuntimeBackpressurePolicy,
    #[serde(default)]
    pub snapshot: RuntimeSnapshotPolicy,
}

impl RuntimeOperationalPolicy {
    /// Loads a policy from a JSON file; missing sections fall back to defaults.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let policy = serde_json::from_slice::<Self>(&bytes).map_err(|err| {
            RuntimeError::Serialization(format!(
                "parse policy {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        Ok(policy)
    }
}

/// Clamps values that would stall the runtime.
pub(crate) fn normalize_runtime_policy(
    mut policy: RuntimeOperationalPolicy,
) -> RuntimeOperationalPolicy {
    policy.retry.max_attempts = policy.retry.max_attempts.max(1);
    policy.backpressure.max_inflight = policy.backpressure.max_inflight.max(1);
    policy.backpressure.acquire_timeout_ms = policy.backpressure.acquire_timeout_ms.max(10);
    policy
}
