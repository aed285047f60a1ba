//! In-memory image of the durable tables.
//!
//! The tables are only ever changed by applying journal records, both live
//! (after the journal accepted the record) and during recovery. That keeps the
//! visible state equal to "snapshot + journal" at all times.

use crate::core::{EntityKey, Result, RuntimeError};
use crate::history::{HistoryEvent, HistoryEventKind};
use crate::journal::{JournalRecord, RUNTIME_FORMAT_VERSION, StoreOp, StoreSnapshot};
use crate::orchestration::{OrchestrationInstance, OrchestrationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{Level, event};
use uuid::Uuid;

/// How a message expects to be answered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum MessageMode {
    /// Fire-and-forget.
    Signal,
    /// Request/response on behalf of an orchestration call.
    Call { instance_id: String, call_id: u64 },
}

/// One operation request queued for an entity. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMessage {
    pub message_id: Uuid,
    pub target: EntityKey,
    pub operation: String,
    pub payload: Value,
    pub mode: MessageMode,
    pub arrival_seq: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Current committed state of one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub state: Value,
    pub operations_applied: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mailbox {
    pub next_arrival_seq: u64,
    pub pending: VecDeque<EntityMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxSnapshot {
    pub key: EntityKey,
    pub next_arrival_seq: u64,
    pub pending: Vec<EntityMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHistory {
    pub instance_id: String,
    pub events: Vec<HistoryEvent>,
}

#[derive(Debug, Default)]
pub struct StoreTables {
    entities: HashMap<EntityKey, EntityRecord>,
    mailboxes: HashMap<EntityKey, Mailbox>,
    histories: HashMap<String, Vec<HistoryEvent>>,
    instances: HashMap<String, OrchestrationInstance>,
    /// Message ids that may still be re-delivered; re-deliveries are dropped.
    /// Call ids leave the set once their instance is terminal and the message
    /// was dequeued, since nothing enqueues calls for a finished instance.
    delivered: HashSet<Uuid>,
    last_seq: u64,
    /// Highest seq handed out for an append, including appends that failed.
    reserved_seq: u64,
}

impl StoreTables {
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Sequence number for the next journal record. A seq handed out for an
    /// append that failed is never reused, since the journal may hold it.
    pub fn next_record_seq(&mut self) -> u64 {
        let seq = self.last_seq.max(self.reserved_seq) + 1;
        self.reserved_seq = seq;
        seq
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.entities.get(key)
    }

    pub fn instance(&self, instance_id: &str) -> Option<&OrchestrationInstance> {
        self.instances.get(instance_id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &OrchestrationInstance> {
        self.instances.values()
    }

    pub fn history(&self, instance_id: &str) -> &[HistoryEvent] {
        self.histories
            .get(instance_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn front_message(&self, key: &EntityKey) -> Option<&EntityMessage> {
        self.mailboxes.get(key).and_then(|mailbox| mailbox.pending.front())
    }

    pub fn pending_messages(&self, key: &EntityKey) -> usize {
        self.mailboxes
            .get(key)
            .map(|mailbox| mailbox.pending.len())
            .unwrap_or(0)
    }

    pub fn is_delivered(&self, message_id: &Uuid) -> bool {
        self.delivered.contains(message_id)
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn non_empty_mailboxes(&self) -> Vec<EntityKey> {
        let mut keys = self
            .mailboxes
            .iter()
            .filter(|(_, mailbox)| !mailbox.pending.is_empty())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn total_pending_messages(&self) -> usize {
        self.mailboxes.values().map(|mailbox| mailbox.pending.len()).sum()
    }

    pub fn running_instances(&self) -> Vec<String> {
        let mut ids = self
            .instances
            .values()
            .filter(|instance| instance.status == OrchestrationStatus::Running)
            .map(|instance| instance.instance_id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn count_by_status(&self, status: OrchestrationStatus) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.status == status)
            .count()
    }

    /// Starts a batch of operations against the current tables.
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            tables: self,
            ops: Vec::new(),
            next_arrivals: HashMap::new(),
            next_history_seqs: HashMap::new(),
            enqueued: HashSet::new(),
        }
    }

    /// Applies a committed record. Records at or below `last_seq` were already applied.
    ///
    /// Every op is idempotent by content: a record whose append reported failure
    /// may still sit in the journal next to the record that retried it.
    pub fn apply_record(&mut self, record: JournalRecord) -> Result<()> {
        if record.seq <= self.last_seq {
            event!(Level::DEBUG, seq = record.seq, "skipping already applied journal record");
            return Ok(());
        }
        self.last_seq = record.seq;
        self.reserved_seq = self.reserved_seq.max(record.seq);
        for op in record.ops {
            self.apply_op(record.seq, op)?;
        }
        Ok(())
    }

    fn apply_op(&mut self, record_seq: u64, op: StoreOp) -> Result<()> {
        match op {
            StoreOp::PutEntity { record } => {
                self.entities.insert(record.key.clone(), record);
            }
            StoreOp::Enqueue { mut message } => {
                if !self.delivered.insert(message.message_id) {
                    return Ok(());
                }
                let mailbox = self.mailboxes.entry(message.target.clone()).or_default();
                message.arrival_seq = message.arrival_seq.max(mailbox.next_arrival_seq);
                mailbox.next_arrival_seq = message.arrival_seq + 1;
                mailbox.pending.push_back(message);
            }
            StoreOp::Dequeue { key, message_id } => {
                let removed = self.mailboxes.get_mut(&key).and_then(|mailbox| {
                    let index = mailbox
                        .pending
                        .iter()
                        .position(|message| message.message_id == message_id)?;
                    mailbox.pending.remove(index)
                });
                if let Some(MessageMode::Call { instance_id, .. }) =
                    removed.map(|message| message.mode)
                {
                    if self.is_terminal(&instance_id) {
                        self.delivered.remove(&message_id);
                    }
                }
            }
            StoreOp::AppendHistory {
                instance_id,
                event: mut history_event,
            } => {
                let history = self.histories.entry(instance_id.clone()).or_default();
                let position = history.len() as u64;
                if history_event.seq > position {
                    return Err(RuntimeError::Corrupted(format!(
                        "journal record {} appends history event {} of {} but only {} exist",
                        record_seq, history_event.seq, instance_id, position
                    )));
                }
                if already_recorded(history, &history_event.kind) {
                    event!(
                        Level::DEBUG,
                        instance_id = %instance_id,
                        seq = history_event.seq,
                        "duplicate history event skipped"
                    );
                    return Ok(());
                }
                history_event.seq = position;
                history.push(history_event);
            }
            StoreOp::PutInstance { instance } => {
                if let Some(existing) = self.instances.get(&instance.instance_id) {
                    if existing.status.is_terminal() && !instance.status.is_terminal() {
                        return Ok(());
                    }
                }
                let finished = instance.status.is_terminal().then(|| instance.instance_id.clone());
                self.instances.insert(instance.instance_id.clone(), instance);
                if let Some(instance_id) = finished {
                    self.forget_settled_calls(&instance_id);
                }
            }
        }
        Ok(())
    }

    fn is_terminal(&self, instance_id: &str) -> bool {
        self.instances
            .get(instance_id)
            .map(|instance| instance.status.is_terminal())
            .unwrap_or(false)
    }

    /// Drops the delivered ids of a finished instance's calls that already left
    /// their mailbox. Ids still queued are dropped by their dequeue.
    fn forget_settled_calls(&mut self, instance_id: &str) {
        let Some(history) = self.histories.get(instance_id) else {
            return;
        };
        for history_event in history {
            let HistoryEventKind::EntityCallScheduled {
                target, message_id, ..
            } = &history_event.kind
            else {
                continue;
            };
            let queued = self
                .mailboxes
                .get(target)
                .map(|mailbox| mailbox.pending.iter().any(|m| m.message_id == *message_id))
                .unwrap_or(false);
            if !queued {
                self.delivered.remove(message_id);
            }
        }
    }

    pub fn export_snapshot(&self) -> StoreSnapshot {
        let mut entities = self.entities.values().cloned().collect::<Vec<_>>();
        entities.sort_by(|a, b| a.key.cmp(&b.key));

        let mut mailboxes = self
            .mailboxes
            .iter()
            .map(|(key, mailbox)| MailboxSnapshot {
                key: key.clone(),
                next_arrival_seq: mailbox.next_arrival_seq,
                pending: mailbox.pending.iter().cloned().collect(),
            })
            .collect::<Vec<_>>();
        mailboxes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut histories = self
            .histories
            .iter()
            .map(|(instance_id, events)| InstanceHistory {
                instance_id: instance_id.clone(),
                events: events.clone(),
            })
            .collect::<Vec<_>>();
        histories.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let mut instances = self.instances.values().cloned().collect::<Vec<_>>();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let mut delivered = self.delivered.iter().copied().collect::<Vec<_>>();
        delivered.sort();

        StoreSnapshot {
            format_version: RUNTIME_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            last_seq: self.last_seq,
            entities,
            mailboxes,
            histories,
            instances,
            delivered,
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            entities: snapshot
                .entities
                .into_iter()
                .map(|record| (record.key.clone(), record))
                .collect(),
            mailboxes: snapshot
                .mailboxes
                .into_iter()
                .map(|mailbox| {
                    (
                        mailbox.key,
                        Mailbox {
                            next_arrival_seq: mailbox.next_arrival_seq,
                            pending: mailbox.pending.into(),
                        },
                    )
                })
                .collect(),
            histories: snapshot
                .histories
                .into_iter()
                .map(|history| (history.instance_id, history.events))
                .collect(),
            instances: snapshot
                .instances
                .into_iter()
                .map(|instance| (instance.instance_id.clone(), instance))
                .collect(),
            delivered: snapshot.delivered.into_iter().collect(),
            last_seq: snapshot.last_seq,
            reserved_seq: snapshot.last_seq,
        }
    }
}

/// True when `history` already holds the event `kind` describes. Started and
/// terminal events occur once; call events are unique per call id.
fn already_recorded(history: &[HistoryEvent], kind: &HistoryEventKind) -> bool {
    history.iter().any(|existing| match (&existing.kind, kind) {
        (HistoryEventKind::OrchestrationStarted { .. }, HistoryEventKind::OrchestrationStarted { .. }) => true,
        (
            HistoryEventKind::EntityCallScheduled { call_id: a, .. },
            HistoryEventKind::EntityCallScheduled { call_id: b, .. },
        ) => a == b,
        (
            HistoryEventKind::EntityCallCompleted { call_id: a, .. }
            | HistoryEventKind::EntityCallFailed { call_id: a, .. },
            HistoryEventKind::EntityCallCompleted { call_id: b, .. }
            | HistoryEventKind::EntityCallFailed { call_id: b, .. },
        ) => a == b,
        (existing, new) => existing.is_terminal() && new.is_terminal(),
    })
}

/// Accumulates the operations of one atomic journal record.
///
/// Sequence numbers (mailbox arrival, history position) are assigned here,
/// against the tables the batch was started from plus what the batch itself
/// already added.
pub struct StoreBatch<'a> {
    tables: &'a StoreTables,
    ops: Vec<StoreOp>,
    next_arrivals: HashMap<EntityKey, u64>,
    next_history_seqs: HashMap<String, u64>,
    enqueued: HashSet<Uuid>,
}

impl StoreBatch<'_> {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }

    /// Queues a message for `target`. Returns false when the id was already delivered.
    pub fn enqueue(
        &mut self,
        message_id: Uuid,
        target: EntityKey,
        operation: String,
        payload: Value,
        mode: MessageMode,
    ) -> bool {
        if self.tables.is_delivered(&message_id) || !self.enqueued.insert(message_id) {
            return false;
        }

        let tables = self.tables;
        let arrival_seq = *self.next_arrivals.entry(target.clone()).or_insert_with(|| {
            tables
                .mailboxes
                .get(&target)
                .map(|mailbox| mailbox.next_arrival_seq)
                .unwrap_or(0)
        });
        self.next_arrivals.insert(target.clone(), arrival_seq + 1);

        self.ops.push(StoreOp::Enqueue {
            message: EntityMessage {
                message_id,
                target,
                operation,
                payload,
                mode,
                arrival_seq,
                enqueued_at: Utc::now(),
            },
        });
        true
    }

    pub fn dequeue(&mut self, key: EntityKey, message_id: Uuid) {
        self.ops.push(StoreOp::Dequeue { key, message_id });
    }

    pub fn put_entity(&mut self, key: EntityKey, state: Value) {
        let operations_applied = self
            .tables
            .entity(&key)
            .map(|record| record.operations_applied)
            .unwrap_or(0)
            + 1;
        self.ops.push(StoreOp::PutEntity {
            record: EntityRecord {
                key,
                state,
                operations_applied,
                updated_at: Utc::now(),
            },
        });
    }

    pub fn append_history(&mut self, instance_id: &str, kind: HistoryEventKind) {
        let tables = self.tables;
        let seq = *self
            .next_history_seqs
            .entry(instance_id.to_string())
            .or_insert_with(|| tables.history(instance_id).len() as u64);
        self.next_history_seqs.insert(instance_id.to_string(), seq + 1);

        self.ops.push(StoreOp::AppendHistory {
            instance_id: instance_id.to_string(),
            event: HistoryEvent {
                seq,
                recorded_at: Utc::now(),
                kind,
            },
        });
    }

    pub fn put_instance(&mut self, instance: OrchestrationInstance) {
        self.ops.push(StoreOp::PutInstance { instance });
    }
}
