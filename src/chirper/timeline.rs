use super::{Chirp, UserChirps, UserFollows};
use crate::core::EntityKey;
use crate::entity::Entity;
use crate::orchestration::{OrchestrationContext, OrchestrationError};
use serde_json::Value;
use std::collections::HashSet;

pub const TIMELINE_ORCHESTRATION: &str = "GetTimeline";

/// Input: the user id as a JSON string. Output: chirps of every followed user,
/// oldest first.
pub async fn get_timeline(
    ctx: OrchestrationContext,
    input: Value,
) -> Result<Value, OrchestrationError> {
    let user_id: String = serde_json::from_value(input)
        .map_err(|err| OrchestrationError::InvalidInput(format!("expected user id: {}", err)))?;
    ctx.log(format!("building timeline for {}", user_id));

    let followed: Vec<String> = ctx
        .call_entity(EntityKey::new(UserFollows::KIND, &user_id), "Get", Value::Null)
        .into_typed()
        .await?;

    let mut seen = HashSet::new();
    let calls = followed
        .into_iter()
        .filter(|user| seen.insert(user.clone()))
        .map(|user| ctx.call_entity(EntityKey::new(UserChirps::KIND, user), "Get", Value::Null))
        .collect::<Vec<_>>();
    let results = ctx.when_all(calls).await?;

    let mut timeline = Vec::new();
    for value in results {
        let chirps: Vec<Chirp> = serde_json::from_value(value).map_err(|err| {
            OrchestrationError::Failed(format!("chirps cannot be decoded: {}", err))
        })?;
        timeline.extend(chirps);
    }
    timeline.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    ctx.log(format!("timeline for {} has {} chirps", user_id, timeline.len()));

    serde_json::to_value(timeline)
        .map_err(|err| OrchestrationError::Failed(format!("timeline cannot be encoded: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureDetails;
    use crate::history::{HistoryEvent, HistoryEventKind, HistoryLog};
    use crate::orchestration::{OrchestratorFn, TurnOutcome, run_turn};
    use chrono::{TimeZone, Utc};
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn orchestrator() -> OrchestratorFn {
        Arc::new(|ctx, input| get_timeline(ctx, input).boxed_local())
    }

    fn push(events: &mut Vec<HistoryEvent>, kind: HistoryEventKind) {
        events.push(HistoryEvent {
            seq: events.len() as u64,
            recorded_at: Utc::now(),
            kind,
        });
    }

    fn schedule(events: &mut Vec<HistoryEvent>, call_id: u64, target: EntityKey) {
        push(
            events,
            HistoryEventKind::EntityCallScheduled {
                call_id,
                target,
                operation: "Get".into(),
                payload: Value::Null,
                message_id: Uuid::new_v4(),
            },
        );
    }

    fn chirp(user: &str, minute: u32) -> Chirp {
        Chirp {
            user_id: user.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            content: format!("{}-{}", user, minute),
        }
    }

    #[test]
    fn duplicate_follows_are_fetched_once_and_merge_is_sorted() {
        let f = orchestrator();
        let mut events = Vec::new();
        push(
            &mut events,
            HistoryEventKind::OrchestrationStarted {
                name: TIMELINE_ORCHESTRATION.into(),
                input: json!("alice"),
            },
        );
        schedule(&mut events, 0, EntityKey::new("UserFollows", "alice"));
        push(
            &mut events,
            HistoryEventKind::EntityCallCompleted {
                call_id: 0,
                result: json!(["bob", "carol", "bob"]),
            },
        );

        let turn = run_turn(&f, "t1", json!("alice"), &HistoryLog::new(events.clone()));
        assert!(matches!(turn.outcome, TurnOutcome::Suspended));
        assert_eq!(turn.new_calls.len(), 2);

        schedule(&mut events, 1, EntityKey::new("UserChirps", "bob"));
        schedule(&mut events, 2, EntityKey::new("UserChirps", "carol"));
        push(
            &mut events,
            HistoryEventKind::EntityCallCompleted {
                call_id: 2,
                result: serde_json::to_value(vec![chirp("carol", 2)]).unwrap(),
            },
        );
        push(
            &mut events,
            HistoryEventKind::EntityCallCompleted {
                call_id: 1,
                result: serde_json::to_value(vec![chirp("bob", 0), chirp("bob", 5)]).unwrap(),
            },
        );

        let turn = run_turn(&f, "t1", json!("alice"), &HistoryLog::new(events));
        let TurnOutcome::Completed(result) = turn.outcome else {
            panic!("timeline should complete");
        };
        let timeline: Vec<Chirp> = serde_json::from_value(result).unwrap();
        assert_eq!(
            timeline,
            vec![chirp("bob", 0), chirp("carol", 2), chirp("bob", 5)]
        );
    }

    #[test]
    fn non_string_input_fails_the_instance() {
        let turn = run_turn(&orchestrator(), "t2", json!(42), &HistoryLog::default());
        match turn.outcome {
            TurnOutcome::Failed(FailureDetails { error_type, .. }) => {
                assert_eq!(error_type, "InvalidInput")
            }
            _ => panic!("expected failure"),
        }
    }
}
