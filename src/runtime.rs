//! Durable runtime: owns the store tables, the journal, and the work scheduler.

mod actor;
mod dispatcher;
mod policy;

pub use policy::{
    RuntimeBackpressurePolicy, RuntimeDurabilityMode, RuntimeOperationalPolicy,
    RuntimeRetryPolicy, RuntimeSnapshotPolicy,
};

use crate::core::{EntityKey, Result, RuntimeError};
use crate::entity::{Entity, EntityHandler, EntityRegistry};
use crate::history::HistoryEventKind;
use crate::journal::{FileJournal, JournalBackend, RUNTIME_FORMAT_VERSION};
use crate::orchestration::{
    OrchestrationContext, OrchestrationError, OrchestrationInstance, OrchestrationRegistry,
    OrchestrationStatus, OrchestrationStatusReport,
};
use crate::store::{MessageMode, StoreTables};
use chrono::Utc;
use dispatcher::{WorkItem, WorkQueue};
use policy::normalize_runtime_policy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

const IDLE_POLL_INTERVAL_MS: u64 = 5;

/// Collects registrations and policy, then opens a [`Runtime`].
///
/// Everything must be registered before opening: recovery starts re-driving
/// orchestrations and draining mailboxes immediately.
#[derive(Default)]
pub struct RuntimeBuilder {
    policy: RuntimeOperationalPolicy,
    entities: EntityRegistry,
    orchestrations: OrchestrationRegistry,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: RuntimeOperationalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn register_entity<E: Entity>(mut self) -> Self {
        self.entities.register::<E>();
        self
    }

    pub fn register_entity_handler(mut self, handler: Arc<dyn EntityHandler>) -> Self {
        self.entities.register_handler(handler);
        self
    }

    pub fn register_orchestration<F, Fut>(mut self, name: impl Into<String>, orchestrator: F) -> Self
    where
        F: Fn(OrchestrationContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, OrchestrationError>> + 'static,
    {
        self.orchestrations.register(name, orchestrator);
        self
    }

    /// Opens a runtime backed by a [`FileJournal`] in `root_dir`.
    pub async fn open(self, root_dir: impl Into<PathBuf>) -> Result<Runtime> {
        let journal =
            FileJournal::open(root_dir, self.policy.durability.clone()).await?;
        self.open_with_journal(Arc::new(journal)).await
    }

    /// Rebuilds the tables from `journal` (snapshot, then newer records) and
    /// resumes every running orchestration and non-empty mailbox.
    pub async fn open_with_journal(self, journal: Arc<dyn JournalBackend>) -> Result<Runtime> {
        let policy = normalize_runtime_policy(self.policy);

        let mut tables = match journal.read_snapshot().await? {
            Some(snapshot) => {
                if snapshot.format_version != RUNTIME_FORMAT_VERSION {
                    return Err(RuntimeError::Corrupted(format!(
                        "unsupported snapshot format version {}",
                        snapshot.format_version
                    )));
                }
                StoreTables::from_snapshot(snapshot)
            }
            None => StoreTables::default(),
        };
        let records = journal.read_after(tables.last_seq()).await?;
        let replayed = records.len();
        for record in records {
            tables.apply_record(record)?;
        }

        let (status_tx, _) = watch::channel(0u64);
        let inner = Arc::new(RuntimeInner {
            inflight: Arc::new(Semaphore::new(policy.backpressure.max_inflight)),
            policy,
            journal,
            tables: Mutex::new(tables),
            entities: self.entities,
            orchestrations: self.orchestrations,
            work: std::sync::Mutex::new(WorkQueue::default()),
            status_tx,
            closed: AtomicBool::new(false),
            ops_since_snapshot: AtomicUsize::new(0),
        });

        event!(
            Level::INFO,
            journal = %inner.journal.describe(),
            replayed_records = replayed,
            "runtime opened"
        );
        inner.recover().await;
        Ok(Runtime { inner })
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStats {
    pub entities: usize,
    pub pending_messages: usize,
    pub busy_mailboxes: usize,
    pub running_orchestrations: usize,
    pub completed_orchestrations: usize,
    pub failed_orchestrations: usize,
    pub active_work_items: usize,
    /// Message ids kept for re-delivery checks.
    pub delivered_message_ids: usize,
    pub last_seq: u64,
    pub registered_entity_kinds: Vec<String>,
}

pub(crate) struct RuntimeInner {
    policy: RuntimeOperationalPolicy,
    journal: Arc<dyn JournalBackend>,
    tables: Mutex<StoreTables>,
    entities: EntityRegistry,
    orchestrations: OrchestrationRegistry,
    work: std::sync::Mutex<WorkQueue>,
    inflight: Arc<Semaphore>,
    /// Bumped whenever an orchestration reaches a terminal state.
    status_tx: watch::Sender<u64>,
    closed: AtomicBool,
    ops_since_snapshot: AtomicUsize,
}

/// Handle to a running runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn policy(&self) -> &RuntimeOperationalPolicy {
        &self.inner.policy
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Closed);
        }
        Ok(())
    }

    /// Creates an orchestration instance and returns its id.
    pub async fn start_orchestration(&self, name: &str, input: Value) -> Result<String> {
        let instance_id = Uuid::new_v4().simple().to_string();
        self.start_orchestration_with_id(name, instance_id, input).await
    }

    /// Like [`Runtime::start_orchestration`] with a caller-chosen id. Starting an
    /// id that already exists is a no-op returning the same id.
    pub async fn start_orchestration_with_id(
        &self,
        name: &str,
        instance_id: impl Into<String>,
        input: Value,
    ) -> Result<String> {
        self.ensure_open()?;
        let instance_id = instance_id.into();
        if !self.inner.orchestrations.contains(name) {
            return Err(RuntimeError::UnknownOrchestration(name.to_string()));
        }

        let span = info_span!("runtime.orchestration.start", instance_id = %instance_id, name = %name);
        self.record_start(name, instance_id, input)
            .instrument(span)
            .await
    }

    async fn record_start(&self, name: &str, instance_id: String, input: Value) -> Result<String> {
        let mut tables = self.inner.tables.lock().await;
        if tables.instance(&instance_id).is_some() {
            event!(Level::DEBUG, "orchestration instance already exists");
            return Ok(instance_id);
        }

        let now = Utc::now();
        let ops = {
            let mut batch = tables.batch();
            batch.put_instance(OrchestrationInstance {
                instance_id: instance_id.clone(),
                name: name.to_string(),
                input: input.clone(),
                status: OrchestrationStatus::Running,
                result: None,
                failure: None,
                created_at: now,
                updated_at: now,
            });
            batch.append_history(
                &instance_id,
                HistoryEventKind::OrchestrationStarted {
                    name: name.to_string(),
                    input,
                },
            );
            batch.into_ops()
        };
        self.inner.commit_locked(&mut tables, ops).await?;
        self.inner
            .schedule(WorkItem::Orchestration(instance_id.clone()));
        event!(Level::INFO, "orchestration started");
        Ok(instance_id)
    }

    /// Durably enqueues a fire-and-forget operation; returns the message id.
    pub async fn signal_entity(
        &self,
        key: EntityKey,
        operation: &str,
        payload: Value,
    ) -> Result<Uuid> {
        self.signal_entity_with_id(Uuid::new_v4(), key, operation, payload)
            .await
    }

    /// Signal with a caller-chosen message id. Re-sending the same id is
    /// acknowledged but applied only once.
    pub async fn signal_entity_with_id(
        &self,
        message_id: Uuid,
        key: EntityKey,
        operation: &str,
        payload: Value,
    ) -> Result<Uuid> {
        self.ensure_open()?;
        if !self.inner.entities.contains(&key.kind) {
            return Err(RuntimeError::UnknownEntityKind(key.kind));
        }

        let span = info_span!(
            "runtime.entity.signal",
            message_id = %message_id,
            entity = %key,
            operation = %operation
        );
        self.record_signal(message_id, key, operation, payload)
            .instrument(span)
            .await
    }

    async fn record_signal(
        &self,
        message_id: Uuid,
        key: EntityKey,
        operation: &str,
        payload: Value,
    ) -> Result<Uuid> {
        let mut tables = self.inner.tables.lock().await;
        let ops = {
            let mut batch = tables.batch();
            if !batch.enqueue(
                message_id,
                key.clone(),
                operation.to_string(),
                payload,
                MessageMode::Signal,
            ) {
                event!(Level::INFO, "duplicate signal acknowledged without re-enqueue");
                return Ok(message_id);
            }
            batch.into_ops()
        };
        self.inner.commit_locked(&mut tables, ops).await?;
        self.inner.schedule(WorkItem::Entity(key));
        event!(Level::DEBUG, "signal enqueued");
        Ok(message_id)
    }

    /// Committed state of an entity, or `None` if it was never created.
    pub async fn get_entity(&self, key: &EntityKey) -> Result<Option<Value>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables.entity(key).map(|record| record.state.clone()))
    }

    pub async fn get_entity_as<T: DeserializeOwned>(&self, key: &EntityKey) -> Result<Option<T>> {
        self.get_entity(key)
            .await?
            .map(serde_json::from_value::<T>)
            .transpose()
            .map_err(RuntimeError::from)
    }

    pub async fn get_orchestration_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<OrchestrationStatusReport>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .instance(instance_id)
            .map(OrchestrationStatusReport::from))
    }

    /// Waits until the instance is terminal.
    pub async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatusReport> {
        let deadline = Instant::now() + timeout;
        let mut status_rx = self.inner.status_tx.subscribe();
        loop {
            match self.get_orchestration_status(instance_id).await? {
                None => return Err(RuntimeError::InstanceNotFound(instance_id.to_string())),
                Some(report) if report.status.is_terminal() => return Ok(report),
                Some(_) => {}
            }

            match timeout_at(deadline, status_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(RuntimeError::Closed),
                Err(_) => {
                    return Err(RuntimeError::Timeout(format!(
                        "orchestration {} still running after {:?}",
                        instance_id, timeout
                    )));
                }
            }
        }
    }

    /// Waits until no message is queued and no work item is running.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.is_idle().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::Timeout(format!(
                    "runtime still busy after {:?}",
                    timeout
                )));
            }
            sleep(Duration::from_millis(IDLE_POLL_INTERVAL_MS)).await;
        }
    }

    pub async fn stats(&self) -> RuntimeStats {
        let tables = self.inner.tables.lock().await;
        RuntimeStats {
            entities: tables.entity_count(),
            pending_messages: tables.total_pending_messages(),
            busy_mailboxes: tables.non_empty_mailboxes().len(),
            running_orchestrations: tables.count_by_status(OrchestrationStatus::Running),
            completed_orchestrations: tables.count_by_status(OrchestrationStatus::Completed),
            failed_orchestrations: tables.count_by_status(OrchestrationStatus::Failed),
            active_work_items: self.inner.active_work_items(),
            delivered_message_ids: tables.delivered_count(),
            last_seq: tables.last_seq(),
            registered_entity_kinds: self.inner.entities.kinds(),
        }
    }

    /// Writes a snapshot now and compacts the journal behind it.
    pub async fn force_snapshot(&self) -> Result<()> {
        let tables = self.inner.tables.lock().await;
        self.inner.write_snapshot(&tables).await
    }

    /// Stops accepting requests and waits for running work items to finish.
    ///
    /// Queued messages and suspended orchestrations stay in the journal and
    /// resume on the next open.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while self.inner.active_work_items() > 0 {
            if Instant::now() >= deadline {
                return Err(RuntimeError::Timeout(
                    "work items still running at shutdown".to_string(),
                ));
            }
            sleep(Duration::from_millis(IDLE_POLL_INTERVAL_MS)).await;
        }
        event!(Level::INFO, "runtime shut down");
        Ok(())
    }
}
