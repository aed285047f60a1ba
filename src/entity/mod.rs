//! Entity contract: keyed actors that apply one operation at a time to their own state.

use crate::core::FailureDetails;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Domain failure raised by an entity operation.
///
/// These never crash the actor: the state stays as it was and the failure is
/// handed back to `call` callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("Unknown operation '{operation}' for entity kind '{kind}'")]
    UnknownOperation { kind: String, operation: String },

    #[error("Invalid payload for '{operation}': {reason}")]
    InvalidPayload { operation: String, reason: String },

    #[error("{0}")]
    Domain(String),

    #[error("Stored state for entity kind '{kind}' cannot be decoded: {reason}")]
    CorruptState { kind: String, reason: String },
}

impl EntityError {
    pub fn unknown_operation(kind: &str, operation: &str) -> Self {
        Self::UnknownOperation {
            kind: kind.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn invalid_payload(operation: &str, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn failure_details(&self) -> FailureDetails {
        let error_type = match self {
            Self::UnknownOperation { .. } => "UnknownOperation",
            Self::InvalidPayload { .. } => "InvalidPayload",
            Self::Domain(_) => "EntityOperation",
            Self::CorruptState { .. } => "CorruptState",
        };
        FailureDetails::new(error_type, self.to_string())
    }
}

/// A typed entity. The runtime owns (de)serialization; implementors only
/// describe how one operation changes their state.
pub trait Entity: Default + Serialize + DeserializeOwned + 'static {
    /// Kind name used in [`crate::EntityKey::kind`].
    const KIND: &'static str;

    fn apply(&mut self, operation: &str, payload: Value) -> Result<Value, EntityError>;
}

/// Outcome of applying one operation through the type-erased handler.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityApplyOutcome {
    /// State after the operation.
    pub state: Value,
    /// Value returned to `call` callers.
    pub result: Value,
    /// Whether `state` differs from the state before the operation.
    pub changed: bool,
}

/// Type-erased entry in the dispatch table.
pub trait EntityHandler: Send + Sync {
    fn kind(&self) -> &str;

    /// Applies `operation` to `state`; `None` means the entity was never created.
    fn apply(
        &self,
        state: Option<&Value>,
        operation: &str,
        payload: Value,
    ) -> Result<EntityApplyOutcome, EntityError>;
}

/// Adapts an [`Entity`] type to [`EntityHandler`].
pub struct TypedEntityHandler<E> {
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> TypedEntityHandler<E> {
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Default for TypedEntityHandler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityHandler for TypedEntityHandler<E> {
    fn kind(&self) -> &str {
        E::KIND
    }

    fn apply(
        &self,
        state: Option<&Value>,
        operation: &str,
        payload: Value,
    ) -> Result<EntityApplyOutcome, EntityError> {
        let corrupt = |err: serde_json::Error| EntityError::CorruptState {
            kind: E::KIND.to_string(),
            reason: err.to_string(),
        };

        let before = match state {
            Some(value) => value.clone(),
            None => serde_json::to_value(E::default()).map_err(corrupt)?,
        };
        let mut entity: E = serde_json::from_value(before.clone()).map_err(corrupt)?;
        let result = entity.apply(operation, payload)?;
        let after = serde_json::to_value(&entity).map_err(corrupt)?;

        Ok(EntityApplyOutcome {
            changed: after != before,
            state: after,
            result,
        })
    }
}

/// Explicit mapping from entity kind to handler.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    handlers: HashMap<String, Arc<dyn EntityHandler>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Entity>(&mut self) {
        self.register_handler(Arc::new(TypedEntityHandler::<E>::new()));
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EntityHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn EntityHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds = self.handlers.keys().cloned().collect::<Vec<_>>();
        kinds.sort();
        kinds
    }
}

/// Decodes an operation payload into `T`, mapping failures to [`EntityError::InvalidPayload`].
pub fn decode_payload<T: DeserializeOwned>(operation: &str, payload: Value) -> Result<T, EntityError> {
    serde_json::from_value(payload).map_err(|err| EntityError::invalid_payload(operation, err))
}

/// Encodes an operation result.
pub fn encode_result<T: Serialize>(operation: &str, value: &T) -> Result<Value, EntityError> {
    serde_json::to_value(value).map_err(|err| EntityError::invalid_payload(operation, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Default, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    impl Entity for Counter {
        const KIND: &'static str = "Counter";

        fn apply(&mut self, operation: &str, payload: Value) -> Result<Value, EntityError> {
            match operation.to_ascii_lowercase().as_str() {
                "add" => {
                    let delta: i64 = decode_payload(operation, payload)?;
                    if delta < 0 {
                        return Err(EntityError::Domain("negative delta".into()));
                    }
                    self.value += delta;
                    Ok(json!(self.value))
                }
                "get" => Ok(json!(self.value)),
                _ => Err(EntityError::unknown_operation(Self::KIND, operation)),
            }
        }
    }

    #[test]
    fn read_only_operation_on_missing_state_is_unchanged() {
        let handler = TypedEntityHandler::<Counter>::new();
        let outcome = handler.apply(None, "Get", Value::Null).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.result, json!(0));
    }

    #[test]
    fn mutation_reports_changed_state() {
        let handler = TypedEntityHandler::<Counter>::new();
        let outcome = handler.apply(Some(&json!({"value": 2})), "add", json!(3)).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.state, json!({"value": 5}));
        assert_eq!(outcome.result, json!(5));
    }

    #[test]
    fn domain_error_is_returned_not_panicked() {
        let handler = TypedEntityHandler::<Counter>::new();
        let err = handler.apply(None, "add", json!(-1)).unwrap_err();
        assert_eq!(err.failure_details().error_type, "EntityOperation");

        let err = handler.apply(None, "explode", Value::Null).unwrap_err();
        assert!(matches!(err, EntityError::UnknownOperation { .. }));
    }

    #[test]
    fn registry_dispatches_by_kind() {
        let mut registry = EntityRegistry::new();
        registry.register::<Counter>();
        assert!(registry.contains("Counter"));
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.kinds(), vec!["Counter".to_string()]);
    }
}
