//! Deterministic, replayable orchestrations.

mod context;
mod replayer;

pub use context::{EntityCall, OrchestrationContext, WhenAll};
pub use replayer::{TurnOutcome, TurnResult, run_turn};

use crate::core::{EntityKey, FailureDetails};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Orchestration code: an async function of (context, input).
///
/// The returned future is polled on the dispatcher's thread only, so it does not
/// need to be `Send`.
pub type OrchestratorFn = Arc<
    dyn Fn(OrchestrationContext, Value) -> LocalBoxFuture<'static, Result<Value, OrchestrationError>>
        + Send
        + Sync,
>;

/// Failure of a single entity call observed by orchestration code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("call #{call_id} '{operation}' on {target} failed: {failure}")]
pub struct EntityCallError {
    pub call_id: u64,
    pub target: EntityKey,
    pub operation: String,
    pub failure: FailureDetails,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error(transparent)]
    EntityCall(#[from] EntityCallError),

    #[error("Invalid orchestration input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

impl OrchestrationError {
    pub fn failure_details(&self) -> FailureDetails {
        match self {
            Self::EntityCall(err) => FailureDetails::new("EntityCallFailed", err.to_string()),
            Self::InvalidInput(message) => FailureDetails::new("InvalidInput", message.clone()),
            Self::Failed(message) => FailureDetails::new("OrchestrationFailed", message.clone()),
        }
    }
}

/// Lifecycle of an orchestration instance. Terminal states never regress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrchestrationStatus {
    Running,
    Completed,
    Failed,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(label)
    }
}

/// Persisted metadata of one orchestration instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub name: String,
    pub input: Value,
    pub status: OrchestrationStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub failure: Option<FailureDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What `get_orchestration_status` hands to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationStatusReport {
    pub instance_id: String,
    pub name: String,
    pub status: OrchestrationStatus,
    pub result: Option<Value>,
    pub failure: Option<FailureDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&OrchestrationInstance> for OrchestrationStatusReport {
    fn from(instance: &OrchestrationInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            name: instance.name.clone(),
            status: instance.status,
            result: instance.result.clone(),
            failure: instance.failure.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Name → orchestration code.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    orchestrators: HashMap<String, OrchestratorFn>,
}

impl OrchestrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, orchestrator: F)
    where
        F: Fn(OrchestrationContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, OrchestrationError>> + 'static,
    {
        let orchestrator: OrchestratorFn =
            Arc::new(move |ctx, input| orchestrator(ctx, input).boxed_local());
        self.orchestrators.insert(name.into(), orchestrator);
    }

    pub fn get(&self, name: &str) -> Option<OrchestratorFn> {
        self.orchestrators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.orchestrators.contains_key(name)
    }
}
