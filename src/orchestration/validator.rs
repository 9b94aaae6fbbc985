//! Completion predicates for the validator loop.
//!
//! A predicate inspects the run state after a scheduling pass and returns a
//! [`Verdict`]. Predicate errors are not fatal; the loop treats them as
//! "not done" and spends an iteration.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::TaskStatus;
use crate::error::ValidationError;
use crate::workflow::{ExecutionState, Verdict};

#[async_trait]
pub trait CompletionPredicate: Send + Sync {
    async fn is_done(&self, state: &ExecutionState) -> Result<Verdict, ValidationError>;
}

/// Done once every task in the current graph has succeeded.
///
/// When not done, each failed or skipped task becomes a hint so the next
/// plan can route around it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSucceeded;

#[async_trait]
impl CompletionPredicate for AllSucceeded {
    async fn is_done(&self, state: &ExecutionState) -> Result<Verdict, ValidationError> {
        let counts = state.graph.status_counts();
        if counts.total() == counts.succeeded {
            return Ok(Verdict::done(format!(
                "all {} tasks succeeded",
                counts.succeeded
            )));
        }

        let hints: Vec<Value> = state
            .graph
            .tasks()
            .into_iter()
            .filter(|t| t.status != TaskStatus::Succeeded)
            .map(|t| {
                json!({
                    "task": t.id,
                    "tool": t.tool.name,
                    "status": t.status,
                    "error": t.error.as_ref().map(ToString::to_string),
                })
            })
            .collect();
        Ok(Verdict::not_done(format!(
            "{} of {} tasks succeeded ({} failed, {} skipped, {} unfinished)",
            counts.succeeded,
            counts.total(),
            counts.failed,
            counts.skipped,
            counts.unfinished()
        ))
        .with_hints(hints))
    }
}

type Rule = Box<dyn Fn(&ExecutionState) -> Option<Verdict> + Send + Sync>;

/// Rule-based predicate with an optional fallback.
///
/// Rules run in order and the first one that reports done wins. Rules that
/// return `None` or a not-done verdict are passed over. If no rule reports
/// done, the fallback decides; without one the run is not done.
#[derive(Default)]
pub struct RulePredicate {
    rules: Vec<Rule>,
    fallback: Option<Box<dyn CompletionPredicate>>,
}

impl RulePredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&ExecutionState) -> Option<Verdict> + Send + Sync + 'static,
    {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn fallback(mut self, predicate: impl CompletionPredicate + 'static) -> Self {
        self.fallback = Some(Box::new(predicate));
        self
    }
}

#[async_trait]
impl CompletionPredicate for RulePredicate {
    async fn is_done(&self, state: &ExecutionState) -> Result<Verdict, ValidationError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(verdict) = rule(state).filter(|v| v.done) {
                tracing::debug!(rule = index, "completion rule reported done");
                return Ok(verdict);
            }
        }
        match &self.fallback {
            Some(fallback) => fallback.is_done(state).await,
            None => Ok(Verdict::not_done(
                "no rule reported done and no fallback predicate is configured",
            )),
        }
    }
}

/// Read a verdict from model-style text.
///
/// Accepts a JSON object with `done`, `reason` (or `rationale`) and
/// `todo_hints` (or `hints`). Otherwise falls back to a leading yes/no. Text
/// that is neither reads as not done.
pub fn parse_verdict(text: &str) -> Verdict {
    let text = text.trim();
    if text.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
            let done = map.get("done").and_then(Value::as_bool).unwrap_or(false);
            let rationale = map
                .get("reason")
                .or_else(|| map.get("rationale"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let hints = map
                .get("todo_hints")
                .or_else(|| map.get("hints"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            return Verdict {
                done,
                rationale,
                hints,
            };
        }
    }

    let lowered = text.to_lowercase();
    let has_word = |word: &str| lowered.split_whitespace().any(|w| w == word);
    if lowered.starts_with('y') || has_word("yes") {
        return Verdict::done("model replied yes");
    }
    if lowered.starts_with('n') || has_word("no") {
        return Verdict::not_done("model replied no");
    }
    Verdict::not_done("unable to parse validator response; assuming not done")
}
