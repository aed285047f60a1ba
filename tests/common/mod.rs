#![allow(dead_code)]

use async_trait::async_trait;
use durable_entities::entity::{decode_payload, encode_result};
use durable_entities::journal::{JournalRecord, StoreOp, StoreSnapshot};
use durable_entities::store::MessageMode;
use durable_entities::{
    Entity, EntityError, JournalBackend, MemoryJournal, Result, Runtime, RuntimeBuilder,
    RuntimeError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

/// Append-only list of integers; negative amounts are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub entries: Vec<i64>,
    pub total: i64,
}

impl Entity for Ledger {
    const KIND: &'static str = "Ledger";

    fn apply(&mut self, operation: &str, payload: Value) -> std::result::Result<Value, EntityError> {
        match operation.to_ascii_lowercase().as_str() {
            "append" => {
                let amount: i64 = decode_payload(operation, payload)?;
                if amount < 0 {
                    return Err(EntityError::Domain(format!("negative amount {}", amount)));
                }
                self.entries.push(amount);
                self.total += amount;
                encode_result(operation, &self.total)
            }
            "get" => encode_result(operation, &self.total),
            _ => Err(EntityError::unknown_operation(Self::KIND, operation)),
        }
    }
}

pub async fn open_on(journal: Arc<dyn JournalBackend>, builder: RuntimeBuilder) -> Runtime {
    builder
        .register_entity::<Ledger>()
        .open_with_journal(journal)
        .await
        .unwrap()
}

/// Index of the first record enqueueing a call message of `instance_id` to an
/// entity of `kind`.
pub fn first_call_record(records: &[JournalRecord], instance_id: &str, kind: &str) -> usize {
    records
        .iter()
        .position(|record| {
            record.ops.iter().any(|op| match op {
                StoreOp::Enqueue { message } => {
                    message.target.kind == kind
                        && matches!(&message.mode, MessageMode::Call { instance_id: id, .. } if id == instance_id)
                }
                _ => false,
            })
        })
        .unwrap()
}

/// Number of call messages ever enqueued on behalf of `instance_id`.
pub fn call_enqueues(records: &[JournalRecord], instance_id: &str) -> usize {
    records
        .iter()
        .flat_map(|record| record.ops.iter())
        .filter(|op| match op {
            StoreOp::Enqueue { message } => {
                matches!(&message.mode, MessageMode::Call { instance_id: id, .. } if id == instance_id)
            }
            _ => false,
        })
        .count()
}

/// Journal whose appends fail transiently on every `fail_every`-th attempt.
pub struct FlakyJournal {
    pub inner: MemoryJournal,
    fail_every: u32,
    attempts: AtomicU32,
    pub injected: AtomicU32,
}

impl FlakyJournal {
    pub fn new(inner: MemoryJournal, fail_every: u32) -> Self {
        Self {
            inner,
            fail_every,
            attempts: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JournalBackend for FlakyJournal {
    fn describe(&self) -> String {
        "flaky-memory".to_string()
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && attempt % self.fail_every == 0 {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(RuntimeError::Unavailable(format!(
                "injected failure on append attempt {}",
                attempt
            )));
        }
        self.inner.append(record).await
    }

    async fn read_after(&self, after_seq: u64) -> Result<Vec<JournalRecord>> {
        self.inner.read_after(after_seq).await
    }

    async fn read_snapshot(&self) -> Result<Option<StoreSnapshot>> {
        self.inner.read_snapshot().await
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        self.inner.write_snapshot(snapshot).await
    }
}

/// Journal that stores the first record matching `lost_ack` but reports the
/// append as failed, as a backend that times out after a successful write would.
pub struct LostAckJournal {
    pub inner: MemoryJournal,
    lost_ack: fn(&JournalRecord) -> bool,
    pub fired: AtomicU32,
}

impl LostAckJournal {
    pub fn new(inner: MemoryJournal, lost_ack: fn(&JournalRecord) -> bool) -> Self {
        Self {
            inner,
            lost_ack,
            fired: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JournalBackend for LostAckJournal {
    fn describe(&self) -> String {
        "lost-ack-memory".to_string()
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.inner.append(record).await?;
        if (self.lost_ack)(record)
            && self
                .fired
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(RuntimeError::Unavailable(format!(
                "acknowledgement of record {} lost",
                record.seq
            )));
        }
        Ok(())
    }

    async fn read_after(&self, after_seq: u64) -> Result<Vec<JournalRecord>> {
        self.inner.read_after(after_seq).await
    }

    async fn read_snapshot(&self) -> Result<Option<StoreSnapshot>> {
        self.inner.read_snapshot().await
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        self.inner.write_snapshot(snapshot).await
    }
}
