use super::{
    JournalBackend, JournalRecord, RUNTIME_JOURNAL_FILE, RUNTIME_SNAPSHOT_FILE, StoreSnapshot,
};
use crate::core::{Result, RuntimeError};
use crate::runtime::RuntimeDurabilityMode;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{Level, event};

/// JSON-lines journal plus an atomically replaced snapshot file in one directory.
pub struct FileJournal {
    root_dir: PathBuf,
    durability: RuntimeDurabilityMode,
    last_sync_unix_ms: AtomicI64,
}

impl FileJournal {
    /// Opens (creating if needed) the journal directory.
    pub async fn open(
        root_dir: impl Into<PathBuf>,
        durability: RuntimeDurabilityMode,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).await?;
        Ok(Self {
            root_dir,
            durability,
            last_sync_unix_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        })
    }

    /// Returns the path to the snapshot file in the root directory.
    pub fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(RUNTIME_SNAPSHOT_FILE)
    }

    /// Returns the path to the journal file in the root directory.
    pub fn journal_path(&self) -> PathBuf {
        self.root_dir.join(RUNTIME_JOURNAL_FILE)
    }

    fn parse_line(line: &str) -> Result<JournalRecord> {
        serde_json::from_str::<JournalRecord>(line)
            .map_err(|err| RuntimeError::Corrupted(format!("parse journal record: {}", err)))
    }

    /// Reads every record in file order.
    ///
    /// A final line that does not parse is the tail of an append cut short by a
    /// crash; it is truncated away. An unparseable line anywhere else is corruption.
    async fn load_records(&self) -> Result<Vec<(JournalRecord, String)>> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&path).await?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let end = bytes[offset..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|pos| offset + pos + 1)
                .unwrap_or(bytes.len());
            let raw = String::from_utf8_lossy(&bytes[offset..end]);
            let line = raw.trim();
            if !line.is_empty() {
                match Self::parse_line(line) {
                    Ok(record) => records.push((record, line.to_string())),
                    Err(err) if end == bytes.len() => {
                        event!(
                            Level::WARN,
                            path = %path.display(),
                            offset,
                            error = %err,
                            "truncating torn journal tail"
                        );
                        let file = OpenOptions::new().write(true).open(&path).await?;
                        file.set_len(offset as u64).await?;
                        file.sync_data().await?;
                        return Ok(records);
                    }
                    Err(err) => return Err(err),
                }
            }
            offset = end;
        }

        if bytes.last().is_some_and(|byte| *byte != b'\n') {
            let mut file = OpenOptions::new().append(true).open(&path).await?;
            file.write_all(b"\n").await?;
            file.sync_data().await?;
        }
        Ok(records)
    }

    /// Rewrites the journal keeping only records with `seq > keep_after_seq`.
    ///
    /// Retained lines go to a temporary file which then replaces the journal.
    async fn compact(&self, keep_after_seq: u64) -> Result<()> {
        let journal_path = self.journal_path();
        let retained = self
            .load_records()
            .await?
            .into_iter()
            .filter(|(record, _)| record.seq > keep_after_seq)
            .map(|(_, line)| line)
            .collect::<Vec<_>>();

        let tmp_path = journal_path.with_extension("tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        for line in retained {
            tmp.write_all(line.as_bytes()).await?;
            tmp.write_all(b"\n").await?;
        }
        tmp.flush().await?;
        tmp.sync_data().await?;

        fs::rename(&tmp_path, &journal_path).await?;
        Ok(())
    }

    async fn write_line(&self, file: &mut File, line: &str) -> Result<()> {
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let now_ms = Utc::now().timestamp_millis();
        match self.durability {
            RuntimeDurabilityMode::Strict => {
                file.sync_data().await?;
                self.last_sync_unix_ms.store(now_ms, Ordering::Relaxed);
            }
            RuntimeDurabilityMode::Eventual { sync_interval_ms } => {
                let last_sync = self.last_sync_unix_ms.load(Ordering::Relaxed);
                if now_ms - last_sync >= sync_interval_ms as i64 {
                    file.sync_data().await?;
                    self.last_sync_unix_ms.store(now_ms, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JournalBackend for FileJournal {
    fn describe(&self) -> String {
        format!("file:{}", self.root_dir.display())
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await?;
        let start_len = file.metadata().await?.len();

        if let Err(err) = self.write_line(&mut file, &line).await {
            // A retry must not land behind a partial line.
            if let Err(truncate_err) = file.set_len(start_len).await {
                event!(
                    Level::ERROR,
                    seq = record.seq,
                    error = %truncate_err,
                    "could not roll back partial journal append"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn read_after(&self, after_seq: u64) -> Result<Vec<JournalRecord>> {
        let mut records = self
            .load_records()
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .filter(|record| record.seq > after_seq)
            .collect::<Vec<_>>();

        records.sort_by(|a, b| a.seq.cmp(&b.seq));
        records.dedup_by(|a, b| a.seq == b.seq);
        Ok(records)
    }

    async fn read_snapshot(&self) -> Result<Option<StoreSnapshot>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path).await?;
        let snapshot = serde_json::from_slice::<StoreSnapshot>(&bytes)
            .map_err(|err| RuntimeError::Corrupted(format!("parse snapshot: {}", err)))?;
        Ok(Some(snapshot))
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let path = self.snapshot_path();
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &path).await?;

        self.compact(snapshot.last_seq).await
    }

    async fn journal_size_bytes(&self) -> Result<u64> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(0);
        }
        Ok(fs::metadata(&path).await?.len())
    }
}
