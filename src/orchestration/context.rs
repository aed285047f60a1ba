use super::{EntityCallError, OrchestrationError};
use crate::core::{EntityKey, FailureDetails};
use crate::history::{HistoryLog, RecordedCall};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{Level, event};

/// Per-turn replay state shared by the context and every call future it hands out.
#[derive(Debug)]
pub(super) struct TurnState {
    recorded: Vec<RecordedCall>,
    outcomes: HashMap<u64, Result<Value, FailureDetails>>,
    next_call_id: u64,
    pub(super) new_calls: Vec<RecordedCall>,
    pub(super) violation: Option<String>,
}

impl TurnState {
    fn from_history(history: &HistoryLog) -> Self {
        let recorded = history.scheduled_calls();
        let mut violation = None;
        for (position, call) in recorded.iter().enumerate() {
            if call.call_id != position as u64 {
                violation = Some(format!(
                    "history call ids are not dense: position {} holds call #{}",
                    position, call.call_id
                ));
                break;
            }
        }

        let outcomes = recorded
            .iter()
            .filter_map(|call| {
                history
                    .call_outcome(call.call_id)
                    .map(|outcome| (call.call_id, outcome))
            })
            .collect();

        Self {
            recorded,
            outcomes,
            next_call_id: 0,
            new_calls: Vec::new(),
            violation,
        }
    }

    pub(super) fn issued_calls(&self) -> u64 {
        self.next_call_id
    }

    pub(super) fn recorded_calls(&self) -> u64 {
        self.recorded.len() as u64
    }

    pub(super) fn has_outstanding_call(&self) -> bool {
        (0..self.next_call_id).any(|call_id| !self.outcomes.contains_key(&call_id))
    }

    fn flag_violation(&mut self, message: String) {
        if self.violation.is_none() {
            self.violation = Some(message);
        }
    }
}

/// Handle orchestration code uses to talk to entities.
///
/// Every call takes the next call id; replaying the same code against the same
/// history therefore assigns the same ids to the same calls.
#[derive(Clone)]
pub struct OrchestrationContext {
    instance_id: Rc<str>,
    state: Rc<RefCell<TurnState>>,
}

impl OrchestrationContext {
    pub(super) fn for_history(instance_id: &str, history: &HistoryLog) -> Self {
        Self {
            instance_id: Rc::from(instance_id),
            state: Rc::new(RefCell::new(TurnState::from_history(history))),
        }
    }

    pub(super) fn state(&self) -> &Rc<RefCell<TurnState>> {
        &self.state
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// True while the code is re-executing a position it already passed in an
    /// earlier turn.
    pub fn is_replaying(&self) -> bool {
        let state = self.state.borrow();
        state.next_call_id < state.recorded.len() as u64
    }

    /// Logs only while the code runs past its recorded history, so replayed
    /// positions stay quiet.
    ///
    /// Delivery is at least once: a turn whose commit fails, or that is thrown
    /// away because the history grew meanwhile, runs again and logs again.
    pub fn log(&self, message: impl fmt::Display) {
        if self.is_replaying() {
            return;
        }
        event!(
            Level::INFO,
            instance_id = %self.instance_id,
            "{}",
            message
        );
    }

    /// Schedules (or, when replaying, re-attaches to) a call against an entity.
    pub fn call_entity(
        &self,
        target: EntityKey,
        operation: impl Into<String>,
        payload: Value,
    ) -> EntityCall {
        let operation = operation.into();
        let mut state = self.state.borrow_mut();
        let call_id = state.next_call_id;
        state.next_call_id += 1;

        let call = RecordedCall {
            call_id,
            target: target.clone(),
            operation: operation.clone(),
            payload,
        };

        match state.recorded.get(call_id as usize).cloned() {
            Some(recorded) if recorded != call => {
                state.flag_violation(format!(
                    "call #{} was recorded as '{}' on {} but the orchestration now issues '{}' on {}",
                    call_id, recorded.operation, recorded.target, call.operation, call.target
                ));
            }
            Some(_) => {}
            None => state.new_calls.push(call),
        }

        EntityCall {
            call_id,
            target,
            operation,
            state: self.state.clone(),
        }
    }

    /// Fan-in: resolves once every call has an outcome.
    pub fn when_all(&self, calls: Vec<EntityCall>) -> WhenAll {
        WhenAll { calls }
    }
}

/// Future of one entity call; resolves only from recorded history.
pub struct EntityCall {
    call_id: u64,
    target: EntityKey,
    operation: String,
    state: Rc<RefCell<TurnState>>,
}

impl EntityCall {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn target(&self) -> &EntityKey {
        &self.target
    }

    fn outcome(&self) -> Option<Result<Value, EntityCallError>> {
        let state = self.state.borrow();
        if state.violation.is_some() {
            return None;
        }
        state.outcomes.get(&self.call_id).map(|outcome| {
            outcome.clone().map_err(|failure| EntityCallError {
                call_id: self.call_id,
                target: self.target.clone(),
                operation: self.operation.clone(),
                failure,
            })
        })
    }

    /// Awaits the call and decodes its result.
    pub async fn into_typed<T: DeserializeOwned>(self) -> Result<T, OrchestrationError> {
        let operation = self.operation.clone();
        let target = self.target.clone();
        let value = self.await?;
        serde_json::from_value(value).map_err(|err| {
            OrchestrationError::Failed(format!(
                "result of '{}' on {} cannot be decoded: {}",
                operation, target, err
            ))
        })
    }
}

impl Future for EntityCall {
    type Output = Result<Value, EntityCallError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Join over a set of calls. The first failure in call order wins, but only
/// after every call has an outcome.
pub struct WhenAll {
    calls: Vec<EntityCall>,
}

impl Future for WhenAll {
    type Output = Result<Vec<Value>, EntityCallError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut outcomes = Vec::with_capacity(self.calls.len());
        for call in &self.calls {
            match call.outcome() {
                Some(outcome) => outcomes.push(outcome),
                None => return Poll::Pending,
            }
        }
        Poll::Ready(outcomes.into_iter().collect())
    }
}
