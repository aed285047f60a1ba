use super::{Chirp, TIMELINE_ORCHESTRATION, UserChirps, UserFollows};
use crate::core::{EntityKey, Result, RuntimeError};
use crate::entity::Entity;
use crate::orchestration::OrchestrationStatus;
use crate::runtime::Runtime;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::time::Duration;
use uuid::Uuid;

/// Thin application-side client: one method per Chirper route.
///
/// Writes are signals, acknowledged once durably queued. Reads return `None`
/// for users whose entity was never created.
#[derive(Clone)]
pub struct ChirperClient {
    runtime: Runtime,
}

impl ChirperClient {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn chirps_key(user_id: &str) -> EntityKey {
        EntityKey::new(UserChirps::KIND, user_id)
    }

    fn follows_key(user_id: &str) -> EntityKey {
        EntityKey::new(UserFollows::KIND, user_id)
    }

    pub async fn post_chirp(&self, user_id: &str, content: impl Into<String>) -> Result<Chirp> {
        self.post_chirp_at(user_id, content, Utc::now()).await
    }

    pub async fn post_chirp_at(
        &self,
        user_id: &str,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Chirp> {
        let chirp = Chirp {
            user_id: user_id.to_string(),
            timestamp,
            content: content.into(),
        };
        self.runtime
            .signal_entity(Self::chirps_key(user_id), "Add", serde_json::to_value(&chirp)?)
            .await?;
        Ok(chirp)
    }

    /// Removes every chirp of `user_id` posted at `timestamp`.
    pub async fn delete_chirp(&self, user_id: &str, timestamp: DateTime<Utc>) -> Result<Uuid> {
        self.runtime
            .signal_entity(Self::chirps_key(user_id), "Remove", serde_json::to_value(timestamp)?)
            .await
    }

    pub async fn follow(&self, user_id: &str, followed: &str) -> Result<Uuid> {
        self.runtime
            .signal_entity(Self::follows_key(user_id), "Add", json!(followed))
            .await
    }

    pub async fn unfollow(&self, user_id: &str, followed: &str) -> Result<Uuid> {
        self.runtime
            .signal_entity(Self::follows_key(user_id), "Remove", json!(followed))
            .await
    }

    pub async fn chirps(&self, user_id: &str) -> Result<Option<Vec<Chirp>>> {
        Ok(self
            .runtime
            .get_entity_as::<UserChirps>(&Self::chirps_key(user_id))
            .await?
            .map(|entity| entity.chirps))
    }

    pub async fn follows(&self, user_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .runtime
            .get_entity_as::<UserFollows>(&Self::follows_key(user_id))
            .await?
            .map(|entity| entity.followed_users))
    }

    /// Starts a timeline build and returns the instance id to poll.
    pub async fn start_timeline(&self, user_id: &str) -> Result<String> {
        self.runtime
            .start_orchestration(TIMELINE_ORCHESTRATION, Value::String(user_id.to_string()))
            .await
    }

    /// Builds the timeline and waits for it.
    pub async fn timeline(&self, user_id: &str, timeout: Duration) -> Result<Vec<Chirp>> {
        let instance_id = self.start_timeline(user_id).await?;
        let report = self
            .runtime
            .wait_for_orchestration(&instance_id, timeout)
            .await?;
        match (report.status, report.result, report.failure) {
            (OrchestrationStatus::Completed, Some(result), _) => Ok(serde_json::from_value(result)?),
            (_, _, Some(failure)) => Err(RuntimeError::Execution(format!(
                "timeline {} failed: {}",
                instance_id, failure
            ))),
            (status, _, _) => Err(RuntimeError::Execution(format!(
                "timeline {} ended as {} without a result",
                instance_id, status
            ))),
        }
    }
}
