mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::WAIT;
use durable_entities::chirper::{self, Chirp, ChirperClient, TIMELINE_ORCHESTRATION};
use durable_entities::{
    EntityKey, MemoryJournal, OrchestrationContext, OrchestrationError, OrchestrationStatus,
    Runtime, RuntimeError,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
}

async fn open_client() -> ChirperClient {
    let runtime = chirper::register(Runtime::builder())
        .open_with_journal(Arc::new(MemoryJournal::new()))
        .await
        .unwrap();
    ChirperClient::new(runtime)
}

fn summary(timeline: &[Chirp]) -> Vec<(String, DateTime<Utc>)> {
    timeline
        .iter()
        .map(|chirp| (chirp.user_id.clone(), chirp.timestamp))
        .collect()
}

#[tokio::test]
async fn test_timeline_merges_followed_users_by_timestamp() {
    let client = open_client().await;

    client.follow("alice", "bob").await.unwrap();
    client.follow("alice", "carol").await.unwrap();
    client.post_chirp_at("bob", "morning", at(10, 0)).await.unwrap();
    client.post_chirp_at("bob", "coffee", at(10, 5)).await.unwrap();
    client.post_chirp_at("carol", "hi", at(10, 2)).await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();

    let timeline = client.timeline("alice", WAIT).await.unwrap();
    assert_eq!(
        summary(&timeline),
        vec![
            ("bob".to_string(), at(10, 0)),
            ("carol".to_string(), at(10, 2)),
            ("bob".to_string(), at(10, 5)),
        ]
    );
    assert_eq!(timeline[1].content, "hi");
}

#[tokio::test]
async fn test_timeline_is_stable_across_repeated_runs() {
    let client = open_client().await;
    client.follow("alice", "bob").await.unwrap();
    client.follow("alice", "carol").await.unwrap();
    client.post_chirp_at("bob", "b", at(9, 0)).await.unwrap();
    client.post_chirp_at("carol", "c", at(8, 0)).await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();
    let tracked = client.runtime().stats().await.delivered_message_ids;

    let first = client.timeline("alice", WAIT).await.unwrap();
    let second = client.timeline("alice", WAIT).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(summary(&first)[0], ("carol".to_string(), at(8, 0)));

    // Finished timelines give their call ids back.
    assert_eq!(client.runtime().stats().await.delivered_message_ids, tracked);
}

#[tokio::test]
async fn test_timeline_with_no_followees_is_empty() {
    let client = open_client().await;

    let timeline = client.timeline("loner", WAIT).await.unwrap();
    assert!(timeline.is_empty());

    // Reading follows does not create the entity.
    assert_eq!(client.follows("loner").await.unwrap(), None);
}

#[tokio::test]
async fn test_timeline_counts_followed_user_once() {
    let client = open_client().await;
    client.follow("alice", "bob").await.unwrap();
    client.follow("alice", "bob").await.unwrap();
    client.post_chirp_at("bob", "once", at(11, 0)).await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();

    assert_eq!(
        client.follows("alice").await.unwrap(),
        Some(vec!["bob".to_string()])
    );
    let timeline = client.timeline("alice", WAIT).await.unwrap();
    assert_eq!(timeline.len(), 1);
}

#[tokio::test]
async fn test_timeline_skips_followed_user_without_chirps() {
    let client = open_client().await;
    client.follow("alice", "quiet").await.unwrap();
    client.follow("alice", "bob").await.unwrap();
    client.post_chirp_at("bob", "only", at(12, 0)).await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();

    let timeline = client.timeline("alice", WAIT).await.unwrap();
    assert_eq!(summary(&timeline), vec![("bob".to_string(), at(12, 0))]);
}

/// Calls `Remove` on `UserChirps@bob` and returns the reported count.
async fn remove_bob_chirps_at(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
    let removed = ctx
        .call_entity(EntityKey::new("UserChirps", "bob"), "Remove", input)
        .await?;
    Ok(removed)
}

#[tokio::test]
async fn test_removing_unknown_timestamp_reports_zero_and_keeps_state() {
    let runtime = chirper::register(Runtime::builder())
        .register_orchestration("RemoveBobChirps", remove_bob_chirps_at)
        .open_with_journal(Arc::new(MemoryJournal::new()))
        .await
        .unwrap();
    let client = ChirperClient::new(runtime.clone());
    client.post_chirp_at("bob", "keep", at(10, 0)).await.unwrap();
    runtime.wait_idle(WAIT).await.unwrap();
    let before = runtime
        .get_entity(&EntityKey::new("UserChirps", "bob"))
        .await
        .unwrap()
        .unwrap();

    let instance = runtime
        .start_orchestration("RemoveBobChirps", serde_json::to_value(at(23, 59)).unwrap())
        .await
        .unwrap();
    let report = runtime.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(report.result, Some(json!(0)));

    let after = runtime
        .get_entity(&EntityKey::new("UserChirps", "bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, before);

    let instance = runtime
        .start_orchestration("RemoveBobChirps", serde_json::to_value(at(10, 0)).unwrap())
        .await
        .unwrap();
    let report = runtime.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(report.result, Some(json!(1)));
    assert_eq!(client.chirps("bob").await.unwrap(), Some(Vec::new()));
}

#[tokio::test]
async fn test_delete_chirp_removes_every_chirp_at_timestamp() {
    let client = open_client().await;
    client.post_chirp_at("bob", "one", at(10, 0)).await.unwrap();
    client.post_chirp_at("bob", "two", at(10, 0)).await.unwrap();
    client.post_chirp_at("bob", "three", at(10, 1)).await.unwrap();
    client.delete_chirp("bob", at(10, 0)).await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();

    let chirps = client.chirps("bob").await.unwrap().unwrap();
    assert_eq!(chirps.len(), 1);
    assert_eq!(chirps[0].content, "three");
}

#[tokio::test]
async fn test_unfollow_removes_from_the_followers_set() {
    let client = open_client().await;
    client.follow("alice", "bob").await.unwrap();
    client.follow("alice", "carol").await.unwrap();
    client.post_chirp_at("bob", "b", at(10, 0)).await.unwrap();
    client.post_chirp_at("carol", "c", at(10, 1)).await.unwrap();
    client.unfollow("alice", "bob").await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();

    assert_eq!(
        client.follows("alice").await.unwrap(),
        Some(vec!["carol".to_string()])
    );
    // bob's own chirps are untouched by alice unfollowing him.
    assert_eq!(client.chirps("bob").await.unwrap().unwrap().len(), 1);

    let timeline = client.timeline("alice", WAIT).await.unwrap();
    assert_eq!(summary(&timeline), vec![("carol".to_string(), at(10, 1))]);
}

#[tokio::test]
async fn test_never_created_entities_read_as_missing() {
    let client = open_client().await;
    assert_eq!(client.chirps("ghost").await.unwrap(), None);
    assert_eq!(client.follows("ghost").await.unwrap(), None);
    assert!(
        client
            .runtime()
            .get_orchestration_status("no-such-instance")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_timeline_status_reports_result() {
    let client = open_client().await;
    client.follow("alice", "bob").await.unwrap();
    client.post_chirp_at("bob", "x", at(7, 0)).await.unwrap();
    client.runtime().wait_idle(WAIT).await.unwrap();

    let instance = client.start_timeline("alice").await.unwrap();
    let report = client
        .runtime()
        .wait_for_orchestration(&instance, WAIT)
        .await
        .unwrap();
    assert_eq!(report.status, OrchestrationStatus::Completed);
    assert_eq!(report.name, TIMELINE_ORCHESTRATION);
    assert!(report.failure.is_none());

    let result: Vec<Chirp> = serde_json::from_value(report.result.unwrap()).unwrap();
    assert_eq!(result.len(), 1);
}

#[tokio::test]
async fn test_timeline_with_invalid_input_fails() {
    let client = open_client().await;
    let instance = client
        .runtime()
        .start_orchestration(TIMELINE_ORCHESTRATION, json!({"user": "alice"}))
        .await
        .unwrap();
    let report = client
        .runtime()
        .wait_for_orchestration(&instance, WAIT)
        .await
        .unwrap();
    assert_eq!(report.status, OrchestrationStatus::Failed);
    assert_eq!(report.failure.unwrap().error_type, "InvalidInput");
}

#[tokio::test]
async fn test_unknown_names_are_rejected_at_the_boundary() {
    let client = open_client().await;
    let runtime = client.runtime();

    let err = runtime
        .start_orchestration("NoSuchWorkflow", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownOrchestration(_)));

    let err = runtime
        .signal_entity(EntityKey::new("Ghost", "x"), "Add", json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownEntityKind(_)));
}
