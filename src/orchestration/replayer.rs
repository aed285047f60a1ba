use super::{OrchestrationContext, OrchestratorFn};
use crate::core::FailureDetails;
use crate::history::{HistoryLog, RecordedCall};
use futures::task::noop_waker_ref;
use serde_json::Value;
use std::task::{Context, Poll};

/// How one turn of orchestration code ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(Value),
    Failed(FailureDetails),
    /// Waiting on at least one call without an outcome yet.
    Suspended,
    /// The code no longer agrees with its own history; never retried.
    DeterminismViolation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    /// Calls issued this turn that the history does not contain yet.
    pub new_calls: Vec<RecordedCall>,
}

/// Re-executes orchestration code from the start against `history`.
///
/// The code is polled exactly once. Every call future resolves from recorded
/// outcomes or stays pending, so a single poll advances the code as far as the
/// history allows. No I/O happens here; the caller persists `new_calls`.
pub fn run_turn(
    orchestrator: &OrchestratorFn,
    instance_id: &str,
    input: Value,
    history: &HistoryLog,
) -> TurnResult {
    let ctx = OrchestrationContext::for_history(instance_id, history);
    let mut future = (orchestrator.as_ref())(ctx.clone(), input);
    let mut cx = Context::from_waker(noop_waker_ref());
    let polled = future.as_mut().poll(&mut cx);
    drop(future);

    let mut state = ctx.state().borrow_mut();
    let new_calls = std::mem::take(&mut state.new_calls);

    if let Some(violation) = state.violation.take() {
        return TurnResult {
            outcome: TurnOutcome::DeterminismViolation(violation),
            new_calls: Vec::new(),
        };
    }

    if state.issued_calls() < state.recorded_calls() {
        return TurnResult {
            outcome: TurnOutcome::DeterminismViolation(format!(
                "history records {} calls but the orchestration issued only {}",
                state.recorded_calls(),
                state.issued_calls()
            )),
            new_calls: Vec::new(),
        };
    }

    let outcome = match polled {
        Poll::Ready(Ok(result)) => TurnOutcome::Completed(result),
        Poll::Ready(Err(err)) => TurnOutcome::Failed(err.failure_details()),
        Poll::Pending if state.has_outstanding_call() => TurnOutcome::Suspended,
        Poll::Pending => TurnOutcome::DeterminismViolation(
            "orchestration suspended without awaiting an entity call".to_string(),
        ),
    };

    TurnResult { outcome, new_calls }
}
