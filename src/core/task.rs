//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work bound to a single tool call. Each task
//! tracks its status, attempt counter, and the result or error of its last
//! invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::core::fingerprint::Fingerprint;
use crate::error::{Error, Result, ToolError};

/// Identifier of a task within a graph.
///
/// Ids come from the planner and stay stable across retries and resumes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The external capability a task invokes, plus its argument payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRef {
    /// Registry key of the tool, e.g. `"search"` or `"docs.search"`.
    pub name: String,
    /// Arguments passed to the tool.
    #[serde(default)]
    pub args: Value,
    /// Per-task override of the configured call timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolRef {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            timeout_ms: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.name, &self.args)
    }
}

/// Task status in its lifecycle.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal and never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, eligible for dispatch.
    Ready,
    /// A tool call is in flight (possibly retrying).
    Running,
    Succeeded,
    /// Failed permanently or after exhausting retries.
    Failed,
    /// Not run because an upstream task failed.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Whether a dependent may start once this status is reached.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Structured failure detail recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskError {
    /// The tool call failed (permanently, or transiently with retries exhausted).
    Tool { message: String, transient: bool },
    /// An upstream dependency failed so this task was never started.
    UpstreamFailed { dependency: TaskId },
}

impl From<&ToolError> for TaskError {
    fn from(err: &ToolError) -> Self {
        TaskError::Tool {
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Tool { message, .. } => write!(f, "{}", message),
            TaskError::UpstreamFailed { dependency } => {
                write!(f, "upstream task {} failed", dependency)
            }
        }
    }
}

/// A task as emitted by the planner, before it enters a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    pub tool: ToolRef,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(id: &str, tool: ToolRef) -> Self {
        Self {
            id: TaskId::from(id),
            description: String::new(),
            tool,
            depends_on: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|id| TaskId::from(*id)).collect();
        self
    }
}

/// A single task in the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub tool: ToolRef,
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    /// Number of invocation attempts made so far.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from a planner spec.
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            tool: spec.tool,
            depends_on: spec.depends_on.into_iter().collect(),
            status: TaskStatus::Pending,
            attempt: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.tool.fingerprint()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    fn invalid(&self, to: TaskStatus) -> Error {
        Error::InvalidTaskTransition {
            task: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Transition Pending -> Ready. Ready tasks stay ready.
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Ready => {
                self.status = TaskStatus::Ready;
                Ok(())
            }
            _ => Err(self.invalid(TaskStatus::Ready)),
        }
    }

    /// Transition Ready -> Running. Only ready tasks may start.
    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Ready {
            return Err(self.invalid(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a successful result.
    ///
    /// Returns `false` without touching the task if it is already terminal.
    pub fn succeed(&mut self, attempt: u32, result: Value) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = TaskStatus::Succeeded;
        self.attempt = attempt;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Record a terminal failure. No-op on terminal tasks.
    pub fn fail(&mut self, attempt: u32, error: TaskError) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.attempt = attempt;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Mark the task unrunnable because `dependency` failed. No-op on terminal tasks.
    pub fn skip(&mut self, dependency: TaskId) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = TaskStatus::Skipped;
        self.error = Some(TaskError::UpstreamFailed { dependency });
        self.completed_at = Some(Utc::now());
        true
    }

    /// Put an interrupted task back in line. Used when restoring a checkpoint.
    pub fn reset_interrupted(&mut self) -> bool {
        match self.status {
            TaskStatus::Running | TaskStatus::Ready => {
                self.status = TaskStatus::Pending;
                self.started_at = None;
                true
            }
            _ => false,
        }
    }
}
