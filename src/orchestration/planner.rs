//! Planner collaborator and plan parsing.
//!
//! A planner returns either structured task specs or raw text. Text is
//! reduced to a JSON array (a fenced ```json block, else the outermost
//! `[ ... ]` span) and deserialized into [`TaskSpec`]s. Output that cannot
//! be parsed is re-requested with the parse error as corrective context,
//! a bounded number of times.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::core::{TaskId, TaskSpec};
use crate::error::PlanningError;

/// Everything a planner sees when asked for the next graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanContext {
    pub goal: String,
    pub iteration: u32,
    /// Results of every task that succeeded so far in the run.
    pub results: BTreeMap<TaskId, Value>,
    /// Why the previous iteration was judged incomplete.
    pub rationale: Option<String>,
    /// Follow-up work suggested by the completion predicate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Value>,
    /// Set on re-requests: what was wrong with the previous output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<String>,
}

/// Planner output before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPlan {
    Tasks(Vec<TaskSpec>),
    /// Free-form text expected to contain a JSON array of task specs.
    Text(String),
}

impl RawPlan {
    pub fn into_specs(self) -> Result<Vec<TaskSpec>, PlanningError> {
        match self {
            RawPlan::Tasks(specs) => Ok(specs),
            RawPlan::Text(text) => parse_plan(&text),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, context: &PlanContext) -> Result<RawPlan, PlanningError>;
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid regex"))
}

fn bracketed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"))
}

/// Extract and deserialize a task list from planner text.
pub fn parse_plan(text: &str) -> Result<Vec<TaskSpec>, PlanningError> {
    let trimmed = text.trim();
    let candidate = if let Some(caps) = fenced_json().captures(trimmed) {
        caps.get(1).map_or("", |m| m.as_str())
    } else if let Some(m) = bracketed().find(trimmed) {
        m.as_str()
    } else {
        trimmed
    };

    let value: Value = serde_json::from_str(candidate.trim())
        .map_err(|e| PlanningError::Malformed(format!("invalid JSON: {}", e)))?;
    if !value.is_array() {
        return Err(PlanningError::Malformed(format!(
            "expected a JSON array of tasks, got {}",
            json_kind(&value)
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| PlanningError::Malformed(format!("invalid task: {}", e)))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Ask `planner` for a task list, re-requesting after malformed output.
///
/// Makes at most `repair_attempts + 1` requests. Errors raised by the
/// planner itself are returned immediately.
pub async fn request_plan(
    planner: &dyn Planner,
    context: &PlanContext,
    repair_attempts: u32,
) -> Result<Vec<TaskSpec>, PlanningError> {
    let mut context = context.clone();
    let mut repairs = 0;
    loop {
        let error = match planner.plan(&context).await?.into_specs() {
            Ok(specs) => return Ok(specs),
            Err(PlanningError::Malformed(error)) => error,
            Err(other) => return Err(other),
        };
        if repairs >= repair_attempts {
            return Err(PlanningError::RepairExhausted {
                attempts: repairs,
                last: error,
            });
        }
        repairs += 1;
        tracing::warn!(repair = repairs, error = %error, "malformed plan, re-requesting");
        context.repair = Some(error);
    }
}

/// Returns the same task list on every request.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    specs: Vec<TaskSpec>,
}

impl StaticPlanner {
    pub fn new(specs: Vec<TaskSpec>) -> Self {
        Self { specs }
    }

    /// Load specs from a JSON plan document.
    pub fn from_json(text: &str) -> Result<Self, PlanningError> {
        Ok(Self::new(parse_plan(text)?))
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _context: &PlanContext) -> Result<RawPlan, PlanningError> {
        Ok(RawPlan::Tasks(self.specs.clone()))
    }
}
