//! Per-instance, append-only orchestration history.

use crate::core::{EntityKey, FailureDetails};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Something externally observable that happened to an orchestration instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum HistoryEventKind {
    OrchestrationStarted {
        name: String,
        input: Value,
    },
    EntityCallScheduled {
        call_id: u64,
        target: EntityKey,
        operation: String,
        payload: Value,
        message_id: Uuid,
    },
    EntityCallCompleted {
        call_id: u64,
        result: Value,
    },
    EntityCallFailed {
        call_id: u64,
        failure: FailureDetails,
    },
    OrchestrationCompleted {
        result: Value,
    },
    OrchestrationFailed {
        failure: FailureDetails,
    },
}

impl HistoryEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OrchestrationCompleted { .. } | Self::OrchestrationFailed { .. }
        )
    }
}

/// One history entry; `seq` is dense from 0 and never reassigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub kind: HistoryEventKind,
}

/// A call as recorded by `EntityCallScheduled`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub call_id: u64,
    pub target: EntityKey,
    pub operation: String,
    pub payload: Value,
}

/// Read-only view over an instance's history used by the replayer.
#[derive(Debug, Clone, Default)]
pub struct HistoryLog {
    events: Vec<HistoryEvent>,
}

impl HistoryLog {
    pub fn new(events: Vec<HistoryEvent>) -> Self {
        Self { events }
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Scheduled calls in the order they were recorded.
    pub fn scheduled_calls(&self) -> Vec<RecordedCall> {
        self.events
            .iter()
            .filter_map(|event| match &event.kind {
                HistoryEventKind::EntityCallScheduled {
                    call_id,
                    target,
                    operation,
                    payload,
                    ..
                } => Some(RecordedCall {
                    call_id: *call_id,
                    target: target.clone(),
                    operation: operation.clone(),
                    payload: payload.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Recorded outcome of a call, if one has arrived.
    pub fn call_outcome(&self, call_id: u64) -> Option<Result<Value, FailureDetails>> {
        self.events.iter().find_map(|event| match &event.kind {
            HistoryEventKind::EntityCallCompleted { call_id: id, result } if *id == call_id => {
                Some(Ok(result.clone()))
            }
            HistoryEventKind::EntityCallFailed { call_id: id, failure } if *id == call_id => {
                Some(Err(failure.clone()))
            }
            _ => None,
        })
    }

    pub fn has_scheduled(&self, call_id: u64) -> bool {
        self.events.iter().any(|event| {
            matches!(&event.kind, HistoryEventKind::EntityCallScheduled { call_id: id, .. } if *id == call_id)
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.events.iter().any(|event| event.kind.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: u64, kind: HistoryEventKind) -> HistoryEvent {
        HistoryEvent {
            seq,
            recorded_at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn outcomes_are_found_regardless_of_arrival_order() {
        let log = HistoryLog::new(vec![
            event(0, HistoryEventKind::OrchestrationStarted { name: "t".into(), input: json!("a") }),
            event(1, HistoryEventKind::EntityCallScheduled {
                call_id: 0,
                target: EntityKey::new("K", "b"),
                operation: "Get".into(),
                payload: Value::Null,
                message_id: Uuid::nil(),
            }),
            event(2, HistoryEventKind::EntityCallScheduled {
                call_id: 1,
                target: EntityKey::new("K", "c"),
                operation: "Get".into(),
                payload: Value::Null,
                message_id: Uuid::nil(),
            }),
            event(3, HistoryEventKind::EntityCallCompleted { call_id: 1, result: json!(["c"]) }),
            event(4, HistoryEventKind::EntityCallFailed {
                call_id: 0,
                failure: FailureDetails::new("EntityOperation", "boom"),
            }),
        ]);

        assert_eq!(log.scheduled_calls().len(), 2);
        assert_eq!(log.call_outcome(1), Some(Ok(json!(["c"]))));
        assert!(matches!(log.call_outcome(0), Some(Err(_))));
        assert_eq!(log.call_outcome(7), None);
        assert!(log.has_scheduled(1));
        assert!(!log.is_terminated());
    }
}
