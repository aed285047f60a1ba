// ============================================================================
// Durable Entities Library
// ============================================================================

//! Durable entities and replayable orchestrations.
//!
//! Entities are keyed, single-writer actors whose state lives in a journal.
//! Orchestrations are deterministic async functions that call entities
//! (including fan-out/fan-in) and are re-executed against their recorded
//! history after every completed call and after a restart.
//!
//! ```no_run
//! use durable_entities::chirper::{self, ChirperClient};
//! use durable_entities::Runtime;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = chirper::register(Runtime::builder()).open("./chirper-data").await?;
//! let client = ChirperClient::new(runtime.clone());
//!
//! client.follow("alice", "bob").await?;
//! client.post_chirp("bob", "hello").await?;
//! runtime.wait_idle(Duration::from_secs(5)).await?;
//!
//! let timeline = client.timeline("alice", Duration::from_secs(5)).await?;
//! println!("{} chirps", timeline.len());
//! # Ok(())
//! # }
//! ```

pub mod chirper;
pub mod core;
pub mod entity;
pub mod history;
pub mod journal;
pub mod orchestration;
pub mod runtime;
pub mod store;

// Re-export main types for convenience
pub use crate::core::{EntityKey, FailureDetails, Result, RuntimeError};
pub use entity::{Entity, EntityError, EntityHandler, EntityRegistry};
pub use journal::{FileJournal, JournalBackend, MemoryJournal};
pub use orchestration::{
    EntityCall, EntityCallError, OrchestrationContext, OrchestrationError, OrchestrationStatus,
    OrchestrationStatusReport,
};
pub use runtime::{
    Runtime, RuntimeBuilder, RuntimeDurabilityMode, RuntimeOperationalPolicy, RuntimeStats,
};
