use super::RuntimeInner;
use crate::core::{EntityKey, FailureDetails, Result, RuntimeError};
use crate::history::{HistoryEventKind, HistoryLog};
use crate::journal::{JournalRecord, StoreOp};
use crate::orchestration::{
    OrchestrationInstance, OrchestrationStatus, TurnOutcome, TurnResult, run_turn,
};
use crate::store::{MessageMode, StoreBatch, StoreTables};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Unit of scheduled work. At most one runner exists per item at any time,
/// which makes every entity single-writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum WorkItem {
    Entity(EntityKey),
    Orchestration(String),
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    active: HashSet<WorkItem>,
    /// Items that were scheduled again while running; the runner loops once more.
    rerun: HashSet<WorkItem>,
}

/// Message id of the request for `call_id`. Derived, so a re-run of the same
/// turn produces the same id and the enqueue is dropped as a re-delivery.
pub(crate) fn call_message_id(instance_id: &str, call_id: u64) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}/{}", instance_id, call_id).as_bytes(),
    )
}

impl RuntimeInner {
    /// Appends `ops` as one journal record and applies it to `tables`.
    ///
    /// The caller holds the tables lock for the whole call, so records reach the
    /// journal in `seq` order and memory never runs ahead of the journal.
    pub(crate) async fn commit_locked(
        &self,
        tables: &mut StoreTables,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let record = JournalRecord {
            seq: tables.next_record_seq(),
            ts_unix_ms: Utc::now().timestamp_millis(),
            ops,
        };
        self.append_with_retry(&record).await?;
        tables.apply_record(record)?;

        if let Err(err) = self.maybe_snapshot(tables).await {
            event!(Level::ERROR, error = %err, "runtime post-commit snapshot/compaction failed");
        }
        Ok(())
    }

    async fn append_with_retry(&self, record: &JournalRecord) -> Result<()> {
        let max_attempts = self.policy.retry.max_attempts;
        let mut attempt = 1;
        loop {
            match self.journal.append(record).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    event!(
                        Level::WARN,
                        seq = record.seq,
                        attempt,
                        error = %err,
                        "runtime journal append failed, retrying"
                    );
                    sleep(Duration::from_millis(self.policy.retry.backoff_ms(attempt))).await;
                    attempt += 1;
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        seq = record.seq,
                        attempt,
                        error = %err,
                        "runtime journal append failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn maybe_snapshot(&self, tables: &StoreTables) -> Result<()> {
        let ops = self.ops_since_snapshot.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.policy.snapshot.snapshot_every_ops;
        let mut due = every > 0 && ops >= every;
        if !due {
            let size = self.journal.journal_size_bytes().await?;
            due = size > self.policy.snapshot.compact_if_journal_exceeds_bytes;
        }
        if due {
            self.write_snapshot(tables).await?;
        }
        Ok(())
    }

    pub(crate) async fn write_snapshot(&self, tables: &StoreTables) -> Result<()> {
        let snapshot = tables.export_snapshot();
        self.journal.write_snapshot(&snapshot).await?;
        self.ops_since_snapshot.store(0, Ordering::SeqCst);
        event!(
            Level::INFO,
            last_seq = snapshot.last_seq,
            entities = snapshot.entities.len(),
            instances = snapshot.instances.len(),
            "runtime snapshot written"
        );
        Ok(())
    }

    fn work_queue(&self) -> std::sync::MutexGuard<'_, WorkQueue> {
        match self.work.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn active_work_items(&self) -> usize {
        self.work_queue().active.len()
    }

    /// True when nothing is queued or running. Work is always scheduled before
    /// the tables lock of the commit that produced it is released, so checking
    /// under that lock cannot miss committed-but-unscheduled work.
    pub(crate) async fn is_idle(&self) -> bool {
        let tables = self.tables.lock().await;
        tables.total_pending_messages() == 0 && self.work_queue().active.is_empty()
    }

    /// Runs `item` on the tokio runtime unless a runner for it already exists,
    /// in which case that runner loops once more.
    pub(crate) fn schedule(self: &Arc<Self>, item: WorkItem) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut work = self.work_queue();
            if work.active.contains(&item) {
                work.rerun.insert(item);
                return;
            }
            work.active.insert(item.clone());
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_work_item(item).await });
    }

    async fn run_work_item(self: Arc<Self>, item: WorkItem) {
        let mut failures = 0u32;
        loop {
            let mut retry = false;
            if !self.closed.load(Ordering::SeqCst) {
                let outcome = match self.acquire_inflight_permit().await {
                    Ok(_permit) => self.process(&item).await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(()) => failures = 0,
                    Err(err) if err.is_transient() => {
                        failures += 1;
                        let backoff_ms = self.policy.retry.backoff_ms(failures);
                        event!(
                            Level::WARN,
                            item = ?item,
                            failures,
                            backoff_ms,
                            error = %err,
                            "work item failed, requeueing"
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                        retry = true;
                    }
                    Err(err) => {
                        event!(Level::ERROR, item = ?item, error = %err, "work item failed");
                    }
                }
            }

            let again = {
                let mut work = self.work_queue();
                let again =
                    (work.rerun.remove(&item) || retry) && !self.closed.load(Ordering::SeqCst);
                if !again {
                    work.active.remove(&item);
                    work.rerun.remove(&item);
                }
                again
            };
            if !again {
                return;
            }
        }
    }

    async fn acquire_inflight_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let timeout_ms = self.policy.backpressure.acquire_timeout_ms;
        let fut = self.inflight.clone().acquire_owned();

        timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| {
                RuntimeError::Backpressure(format!(
                    "could not acquire work slot within {}ms",
                    timeout_ms
                ))
            })?
            .map_err(|_| RuntimeError::Closed)
    }

    async fn process(self: &Arc<Self>, item: &WorkItem) -> Result<()> {
        match item {
            WorkItem::Entity(key) => {
                let span = info_span!("runtime.entity.drain", entity = %key);
                self.drain_mailbox(key).instrument(span).await
            }
            WorkItem::Orchestration(instance_id) => {
                let span = info_span!("runtime.orchestration.turn", instance_id = %instance_id);
                self.drive_orchestration(instance_id).instrument(span).await
            }
        }
    }

    /// Replays the instance against its history and commits what the turn decided:
    /// new call requests, or the terminal outcome.
    async fn drive_orchestration(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        let (name, input, history) = {
            let tables = self.tables.lock().await;
            let Some(instance) = tables.instance(instance_id) else {
                event!(Level::WARN, "work scheduled for unknown orchestration instance");
                return Ok(());
            };
            if instance.status.is_terminal() {
                return Ok(());
            }
            (
                instance.name.clone(),
                instance.input.clone(),
                HistoryLog::new(tables.history(instance_id).to_vec()),
            )
        };

        let turn = match self.orchestrations.get(&name) {
            Some(orchestrator) => run_turn(&orchestrator, instance_id, input, &history),
            None => TurnResult {
                outcome: TurnOutcome::Failed(FailureDetails::new(
                    "UnknownOrchestration",
                    format!("no orchestration registered under '{}'", name),
                )),
                new_calls: Vec::new(),
            },
        };

        let mut tables = self.tables.lock().await;
        let Some(instance) = tables.instance(instance_id).cloned() else {
            return Ok(());
        };
        if instance.status.is_terminal() || tables.history(instance_id).len() != history.len() {
            // Someone else already advanced this instance; the rerun picks it up.
            return Ok(());
        }

        let mut targets = BTreeSet::new();
        let mut terminal: Option<OrchestrationInstance> = None;
        let ops = {
            let mut batch = tables.batch();
            for call in &turn.new_calls {
                let message_id = call_message_id(instance_id, call.call_id);
                batch.append_history(
                    instance_id,
                    HistoryEventKind::EntityCallScheduled {
                        call_id: call.call_id,
                        target: call.target.clone(),
                        operation: call.operation.clone(),
                        payload: call.payload.clone(),
                        message_id,
                    },
                );
                batch.enqueue(
                    message_id,
                    call.target.clone(),
                    call.operation.clone(),
                    call.payload.clone(),
                    MessageMode::Call {
                        instance_id: instance_id.to_string(),
                        call_id: call.call_id,
                    },
                );
                targets.insert(call.target.clone());
            }

            let finished = match &turn.outcome {
                TurnOutcome::Suspended => None,
                TurnOutcome::Completed(result) => Some(Ok(result.clone())),
                TurnOutcome::Failed(failure) => Some(Err(failure.clone())),
                TurnOutcome::DeterminismViolation(reason) => {
                    Some(Err(FailureDetails::new("Nondeterminism", reason.clone())))
                }
            };
            if let Some(finished) = finished {
                let mut updated = instance.clone();
                updated.updated_at = Utc::now();
                match finished {
                    Ok(result) => {
                        batch.append_history(
                            instance_id,
                            HistoryEventKind::OrchestrationCompleted {
                                result: result.clone(),
                            },
                        );
                        updated.status = OrchestrationStatus::Completed;
                        updated.result = Some(result);
                    }
                    Err(failure) => {
                        batch.append_history(
                            instance_id,
                            HistoryEventKind::OrchestrationFailed {
                                failure: failure.clone(),
                            },
                        );
                        updated.status = OrchestrationStatus::Failed;
                        updated.failure = Some(failure);
                    }
                }
                batch.put_instance(updated.clone());
                terminal = Some(updated);
            }
            batch.into_ops()
        };

        self.commit_locked(&mut tables, ops).await?;
        for target in targets {
            self.schedule(WorkItem::Entity(target));
        }
        drop(tables);

        event!(
            Level::DEBUG,
            replayed_events = history.len(),
            new_calls = turn.new_calls.len(),
            "orchestration turn committed"
        );
        if let Some(instance) = terminal {
            match &instance.failure {
                Some(failure) => {
                    event!(Level::WARN, failure = %failure, "orchestration failed")
                }
                None => event!(Level::INFO, "orchestration completed"),
            }
            self.notify_status_change();
        }
        Ok(())
    }

    /// Records the outcome of a call message on the calling instance and returns
    /// the instance to wake. Outcomes for instances that already finished are
    /// dropped.
    pub(crate) fn record_call_outcome(
        tables: &StoreTables,
        batch: &mut StoreBatch<'_>,
        mode: &MessageMode,
        outcome: std::result::Result<Value, FailureDetails>,
    ) -> Option<String> {
        let MessageMode::Call {
            instance_id,
            call_id,
        } = mode
        else {
            return None;
        };
        let running = tables
            .instance(instance_id)
            .map(|instance| !instance.status.is_terminal())
            .unwrap_or(false);
        if !running {
            event!(
                Level::DEBUG,
                instance_id = %instance_id,
                call_id,
                "dropping call outcome for finished orchestration"
            );
            return None;
        }

        let kind = match outcome {
            Ok(result) => HistoryEventKind::EntityCallCompleted {
                call_id: *call_id,
                result,
            },
            Err(failure) => HistoryEventKind::EntityCallFailed {
                call_id: *call_id,
                failure,
            },
        };
        batch.append_history(instance_id, kind);
        Some(instance_id.clone())
    }

    fn notify_status_change(&self) {
        self.status_tx.send_modify(|version| *version += 1);
    }

    /// Resumes everything the journal left in flight.
    pub(crate) async fn recover(self: &Arc<Self>) {
        let tables = self.tables.lock().await;
        let running = tables.running_instances();
        let mailboxes = tables.non_empty_mailboxes();
        event!(
            Level::INFO,
            running_orchestrations = running.len(),
            pending_mailboxes = mailboxes.len(),
            "runtime recovery scheduled"
        );
        for instance_id in running {
            self.schedule(WorkItem::Orchestration(instance_id));
        }
        for key in mailboxes {
            self.schedule(WorkItem::Entity(key));
        }
        drop(tables);
    }
}
