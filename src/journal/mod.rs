//! Durable journal: the single source the store tables are rebuilt from.

mod file;
mod memory;

pub use file::FileJournal;
pub use memory::MemoryJournal;

use crate::core::{EntityKey, Result};
use crate::history::HistoryEvent;
use crate::orchestration::OrchestrationInstance;
use crate::store::{EntityMessage, EntityRecord, InstanceHistory, MailboxSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const RUNTIME_SNAPSHOT_FILE: &str = "runtime_snapshot.json";
pub const RUNTIME_JOURNAL_FILE: &str = "runtime_journal.log";
pub const RUNTIME_FORMAT_VERSION: u16 = 1;

/// A single change to the durable tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op")]
pub enum StoreOp {
    /// Replace the committed state of an entity.
    PutEntity { record: EntityRecord },
    /// Append a message to the target's mailbox.
    Enqueue { message: EntityMessage },
    /// Remove a processed message from a mailbox.
    Dequeue { key: EntityKey, message_id: Uuid },
    /// Append one event to an orchestration history.
    AppendHistory {
        instance_id: String,
        event: HistoryEvent,
    },
    /// Create or update orchestration instance metadata.
    PutInstance { instance: OrchestrationInstance },
}

/// One atomic unit of the journal: all of `ops` apply, or none do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalRecord {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub ops: Vec<StoreOp>,
}

/// Structure of the snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub format_version: u16,
    pub created_at_unix_ms: i64,
    pub last_seq: u64,
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub mailboxes: Vec<MailboxSnapshot>,
    #[serde(default)]
    pub histories: Vec<InstanceHistory>,
    #[serde(default)]
    pub instances: Vec<OrchestrationInstance>,
    #[serde(default)]
    pub delivered: Vec<Uuid>,
}

/// Storage abstraction behind the runtime.
///
/// Appends arrive one at a time, already serialized by the runtime's commit
/// lock, with strictly increasing `seq`.
#[async_trait]
pub trait JournalBackend: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Durably appends a record. An error means the record may or may not be stored;
    /// readers de-duplicate by `seq`.
    async fn append(&self, record: &JournalRecord) -> Result<()>;

    /// Records with `seq > after_seq`, sorted by `seq`.
    async fn read_after(&self, after_seq: u64) -> Result<Vec<JournalRecord>>;

    async fn read_snapshot(&self) -> Result<Option<StoreSnapshot>>;

    /// Stores the snapshot and drops the records it covers.
    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()>;

    /// Current journal size, used to trigger compaction.
    async fn journal_size_bytes(&self) -> Result<u64> {
        Ok(0)
    }
}
