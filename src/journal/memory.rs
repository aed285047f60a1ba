use super::{JournalBackend, JournalRecord, StoreSnapshot};
use crate::core::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryJournalState {
    records: Vec<JournalRecord>,
    snapshot: Option<StoreSnapshot>,
}

/// In-process journal. Clones share the same storage, so a runtime can be
/// dropped and reopened on the same journal to simulate a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    state: Arc<Mutex<MemoryJournalState>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal pre-filled with `records`, e.g. a prefix of another journal.
    pub fn from_records(records: Vec<JournalRecord>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryJournalState {
                records,
                snapshot: None,
            })),
        }
    }

    /// Records not yet folded into a snapshot.
    pub async fn records(&self) -> Vec<JournalRecord> {
        self.state.lock().await.records.clone()
    }
}

#[async_trait]
impl JournalBackend for MemoryJournal {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.state.lock().await.records.push(record.clone());
        Ok(())
    }

    async fn read_after(&self, after_seq: u64) -> Result<Vec<JournalRecord>> {
        let state = self.state.lock().await;
        let mut records = state
            .records
            .iter()
            .filter(|record| record.seq > after_seq)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.seq.cmp(&b.seq));
        records.dedup_by(|a, b| a.seq == b.seq);
        Ok(records)
    }

    async fn read_snapshot(&self) -> Result<Option<StoreSnapshot>> {
        Ok(self.state.lock().await.snapshot.clone())
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        state.records.retain(|record| record.seq > snapshot.last_seq);
        state.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
