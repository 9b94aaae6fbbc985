//! Core run type definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a run.
///
/// Uses UUID v7, so ids generated later sort after earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Phases of the validator loop.
///
/// Planning -> Scheduling -> Validating -> {Planning | Composing | Aborted}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Asking the planner for a task graph
    Planning,
    /// Executing the current graph
    Scheduling,
    /// Asking the completion predicate whether the run is done
    Validating,
    /// Done; handing results to the composer
    Composing,
    /// Stopped early; partial results still go to the composer
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Composing | RunPhase::Aborted)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Planning => write!(f, "planning"),
            RunPhase::Scheduling => write!(f, "scheduling"),
            RunPhase::Validating => write!(f, "validating"),
            RunPhase::Composing => write!(f, "composing"),
            RunPhase::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// The completion predicate reported done.
    Completed,
    /// The iteration budget ran out before the predicate reported done.
    BudgetExhausted { iterations: u32 },
    /// The planner never produced usable output.
    PlanningFailed { error: String },
    /// The planner produced a graph that failed validation.
    ConstructionFailed { error: String },
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::BudgetExhausted { iterations } => {
                write!(f, "budget exhausted after {} iterations", iterations)
            }
            RunOutcome::PlanningFailed { error } => write!(f, "planning failed: {}", error),
            RunOutcome::ConstructionFailed { error } => {
                write!(f, "invalid task graph: {}", error)
            }
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Completion predicate verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub done: bool,
    pub rationale: String,
    /// Suggested follow-up work for the next planning cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Value>,
}

impl Verdict {
    pub fn done(rationale: impl Into<String>) -> Self {
        Self {
            done: true,
            rationale: rationale.into(),
            hints: Vec::new(),
        }
    }

    pub fn not_done(rationale: impl Into<String>) -> Self {
        Self {
            done: false,
            rationale: rationale.into(),
            hints: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: Vec<Value>) -> Self {
        self.hints = hints;
        self
    }
}
