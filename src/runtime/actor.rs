use super::RuntimeInner;
use super::dispatcher::WorkItem;
use crate::core::{EntityKey, FailureDetails, Result};
use crate::entity::EntityApplyOutcome;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{Level, event};

impl RuntimeInner {
    /// Applies queued messages for `key` one at a time, in arrival order.
    ///
    /// Each message commits as one record: new state (if it changed), the
    /// dequeue, and for calls the outcome appended to the caller's history.
    pub(crate) async fn drain_mailbox(self: &Arc<Self>, key: &EntityKey) -> Result<()> {
        let handler = self.entities.get(&key.kind);
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let (message, state) = {
                let tables = self.tables.lock().await;
                let Some(message) = tables.front_message(key) else {
                    return Ok(());
                };
                (
                    message.clone(),
                    tables.entity(key).map(|record| record.state.clone()),
                )
            };

            let applied: std::result::Result<EntityApplyOutcome, FailureDetails> = match &handler {
                Some(handler) => handler
                    .apply(state.as_ref(), &message.operation, message.payload.clone())
                    .map_err(|err| err.failure_details()),
                None => Err(FailureDetails::new(
                    "UnknownEntityKind",
                    format!("no entity registered for kind '{}'", key.kind),
                )),
            };

            match &applied {
                Ok(outcome) => event!(
                    Level::DEBUG,
                    message_id = %message.message_id,
                    operation = %message.operation,
                    changed = outcome.changed,
                    "entity operation applied"
                ),
                Err(failure) => event!(
                    Level::WARN,
                    message_id = %message.message_id,
                    operation = %message.operation,
                    failure = %failure,
                    "entity operation rejected"
                ),
            }

            let mut tables = self.tables.lock().await;
            let (ops, wake) = {
                let mut batch = tables.batch();
                if let Ok(outcome) = &applied {
                    if outcome.changed {
                        batch.put_entity(key.clone(), outcome.state.clone());
                    }
                }
                batch.dequeue(key.clone(), message.message_id);
                let wake = RuntimeInner::record_call_outcome(
                    &tables,
                    &mut batch,
                    &message.mode,
                    applied.map(|outcome| outcome.result),
                );
                (batch.into_ops(), wake)
            };
            self.commit_locked(&mut tables, ops).await?;
            if let Some(instance_id) = wake {
                self.schedule(WorkItem::Orchestration(instance_id));
            }
            drop(tables);
        }
    }
}
