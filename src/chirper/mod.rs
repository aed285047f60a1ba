//! Chirper: a small social timeline built on the runtime.
//!
//! `UserChirps` holds what a user posted, `UserFollows` whom they follow, and the
//! `GetTimeline` orchestration fans out over the followed users to merge their
//! chirps by timestamp.

mod client;
mod timeline;

pub use client::ChirperClient;
pub use timeline::{TIMELINE_ORCHESTRATION, get_timeline};

use crate::entity::{Entity, EntityError, decode_payload, encode_result};
use crate::runtime::RuntimeBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chirp {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// Append-only log of a user's chirps, in posting order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserChirps {
    pub chirps: Vec<Chirp>,
}

impl Entity for UserChirps {
    const KIND: &'static str = "UserChirps";

    fn apply(&mut self, operation: &str, payload: Value) -> Result<Value, EntityError> {
        match operation.to_ascii_lowercase().as_str() {
            "add" => {
                let chirp: Chirp = decode_payload(operation, payload)?;
                self.chirps.push(chirp);
                Ok(Value::Null)
            }
            "remove" => {
                let timestamp: DateTime<Utc> = decode_payload(operation, payload)?;
                let before = self.chirps.len();
                self.chirps.retain(|chirp| chirp.timestamp != timestamp);
                encode_result(operation, &(before - self.chirps.len()))
            }
            "get" => encode_result(operation, &self.chirps),
            _ => Err(EntityError::unknown_operation(Self::KIND, operation)),
        }
    }
}

/// Users someone follows, in the order they were followed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFollows {
    pub followed_users: Vec<String>,
}

impl UserFollows {
    fn decode_user(operation: &str, payload: Value) -> Result<String, EntityError> {
        let user: String = decode_payload(operation, payload)?;
        if user.trim().is_empty() {
            return Err(EntityError::Domain("user id must not be empty".to_string()));
        }
        Ok(user)
    }
}

impl Entity for UserFollows {
    const KIND: &'static str = "UserFollows";

    fn apply(&mut self, operation: &str, payload: Value) -> Result<Value, EntityError> {
        match operation.to_ascii_lowercase().as_str() {
            "add" => {
                let user = Self::decode_user(operation, payload)?;
                if self.followed_users.contains(&user) {
                    return Ok(Value::Bool(false));
                }
                self.followed_users.push(user);
                Ok(Value::Bool(true))
            }
            "remove" => {
                let user = Self::decode_user(operation, payload)?;
                match self.followed_users.iter().position(|followed| *followed == user) {
                    Some(index) => {
                        self.followed_users.remove(index);
                        Ok(Value::Bool(true))
                    }
                    None => Ok(Value::Bool(false)),
                }
            }
            "get" => encode_result(operation, &self.followed_users),
            _ => Err(EntityError::unknown_operation(Self::KIND, operation)),
        }
    }
}

/// Registers the Chirper entities and the timeline orchestration.
pub fn register(builder: RuntimeBuilder) -> RuntimeBuilder {
    builder
        .register_entity::<UserChirps>()
        .register_entity::<UserFollows>()
        .register_orchestration(TIMELINE_ORCHESTRATION, get_timeline)
}
