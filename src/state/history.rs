//! Execution history threaded through a run.
//!
//! Every tool invocation produces an [`InvocationRecord`]; every planning
//! cycle produces an [`IterationRecord`]. The history is a plain value owned
//! by the run state and checkpointed with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{Fingerprint, StatusCounts, TaskId};
use crate::workflow::Verdict;

/// What happened on one invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InvocationOutcome {
    /// Served from the result cache; the tool was not called.
    CacheHit,
    Succeeded,
    /// Transient failure; another attempt follows after `retry_in`.
    Retrying { error: String, retry_in: Duration },
    /// Terminal failure for this task.
    Failed { error: String, transient: bool },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InvocationOutcome::CacheHit | InvocationOutcome::Succeeded
        )
    }
}

/// Structured record of a single invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub task_id: TaskId,
    /// Planning cycle the invocation belongs to; set when recorded.
    #[serde(default)]
    pub iteration: u32,
    pub attempt: u32,
    pub tool: String,
    pub fingerprint: Fingerprint,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: InvocationOutcome,
}

/// Summary of one planning cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub planned: usize,
    pub counts: StatusCounts,
    pub verdict: Option<Verdict>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    invocations: Vec<InvocationRecord>,
    iterations: Vec<IterationRecord>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append invocation records, stamping them with `iteration`.
    pub fn record_invocations(
        &mut self,
        iteration: u32,
        records: impl IntoIterator<Item = InvocationRecord>,
    ) {
        self.invocations
            .extend(records.into_iter().map(|mut record| {
                record.iteration = iteration;
                record
            }));
    }

    /// Open the record for a new planning cycle.
    pub fn begin_iteration(&mut self, iteration: u32) {
        self.iterations.push(IterationRecord {
            iteration,
            planned: 0,
            counts: StatusCounts::default(),
            verdict: None,
            started_at: Utc::now(),
            finished_at: None,
        });
    }

    /// The record for `iteration`, opening one if it is missing.
    pub fn iteration_mut(&mut self, iteration: u32) -> &mut IterationRecord {
        let pos = match self.iterations.iter().position(|r| r.iteration == iteration) {
            Some(pos) => pos,
            None => {
                self.begin_iteration(iteration);
                self.iterations.len() - 1
            }
        };
        &mut self.iterations[pos]
    }

    pub fn invocations(&self) -> &[InvocationRecord] {
        &self.invocations
    }

    pub fn iterations(&self) -> &[IterationRecord] {
        &self.iterations
    }

    /// Invocation records for one task, in order.
    pub fn for_task<'a: 'b, 'b>(&'a self, id: &'b TaskId) -> impl Iterator<Item = &'a InvocationRecord> + 'b {
        self.invocations.iter().filter(move |r| &r.task_id == id)
    }

    /// Number of records where the tool was actually called.
    pub fn tool_calls(&self) -> usize {
        self.invocations
            .iter()
            .filter(|r| r.outcome != InvocationOutcome::CacheHit)
            .count()
    }
}
