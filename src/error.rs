use std::time::Duration;

use thiserror::Error;

use crate::core::TaskId;
use crate::workflow::RunId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Graph construction failed: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTaskTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("No checkpoint found for run {0}")]
    CheckpointNotFound(RunId),

    #[error("Composer failed: {0}")]
    Composer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a set of tasks cannot be turned into a graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("dependency cycle through: {}", format_cycle(.tasks))]
    Cycle { tasks: Vec<TaskId> },
}

fn format_cycle(tasks: &[TaskId]) -> String {
    tasks
        .iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// The planner collaborator itself failed.
    #[error("planner error: {0}")]
    Planner(String),

    /// Output could not be parsed into task specs.
    #[error("malformed plan: {0}")]
    Malformed(String),

    #[error("plan still malformed after {attempts} repair attempts: {last}")]
    RepairExhausted { attempts: u32, last: String },
}

/// Failure of a single tool call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("transient tool failure: {0}")]
    Transient(String),

    #[error("permanent tool failure: {0}")]
    Permanent(String),

    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolError {
    /// Transient failures are retried with backoff; everything else fails the task.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_) | ToolError::Timeout(_))
    }
}

/// The completion predicate failed to produce a verdict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);
