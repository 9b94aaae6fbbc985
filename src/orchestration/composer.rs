//! Composer collaborator: turns a finished run into user-facing output.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::workflow::ExecutionState;

/// Receives the final state, aborted runs included.
#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, state: &ExecutionState) -> Result<String>;
}

/// Pretty-printed JSON summary of outcome, verdict and task results.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSummaryComposer;

impl JsonSummaryComposer {
    pub fn summary(state: &ExecutionState) -> Value {
        let tasks: Vec<Value> = state
            .graph
            .tasks()
            .into_iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "status": t.status,
                    "attempt": t.attempt,
                    "result": t.result,
                    "error": t.error.as_ref().map(ToString::to_string),
                })
            })
            .collect();
        json!({
            "run_id": state.run_id,
            "goal": state.goal,
            "outcome": state.outcome,
            "phase": state.phase(),
            "iterations": state.iteration() + 1,
            "verdict": state.verdict,
            "tasks": tasks,
            "results": state.result_values(),
        })
    }
}

#[async_trait]
impl Composer for JsonSummaryComposer {
    async fn compose(&self, state: &ExecutionState) -> Result<String> {
        Ok(serde_json::to_string_pretty(&Self::summary(state))?)
    }
}
