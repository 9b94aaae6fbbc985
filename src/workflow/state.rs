//! Run state with phase transition validation.
//!
//! `ExecutionState` is the per-run aggregate the validator loop drives: the
//! current task graph, the iteration counter, results carried across
//! re-plans and the execution history. Phase changes go through
//! [`ExecutionState::transition`], which rejects anything outside
//!
//! Planning -> Scheduling -> Validating -> {Planning | Composing | Aborted}
//!
//! Planning and Scheduling may also abort directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::{CarriedResult, TaskGraph, TaskId};
use crate::error::{Error, Result};
use crate::state::ExecutionHistory;

use super::{RunId, RunOutcome, RunPhase, Verdict};

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: RunPhase,
    /// Iteration counter at the time the phase was entered.
    pub iteration: u32,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: RunId,
    pub goal: String,
    iteration: u32,
    phase: RunPhase,
    phase_history: Vec<PhaseHistoryEntry>,
    /// Graph for the current planning cycle.
    pub graph: TaskGraph,
    /// Every result that succeeded in this run so far, newest wins.
    pub results: BTreeMap<TaskId, CarriedResult>,
    pub history: ExecutionHistory,
    /// Most recent completion verdict.
    pub verdict: Option<Verdict>,
    pub outcome: Option<RunOutcome>,
    /// Composer output, set once the run reaches a terminal phase.
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Fresh run at iteration 0 with an empty graph.
    pub fn new(goal: impl Into<String>) -> Self {
        Self::with_run_id(RunId::new(), goal)
    }

    pub fn with_run_id(run_id: RunId, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            goal: goal.into(),
            iteration: 0,
            phase: RunPhase::Planning,
            phase_history: vec![PhaseHistoryEntry {
                phase: RunPhase::Planning,
                iteration: 0,
                entered_at: now,
            }],
            graph: TaskGraph::new(),
            results: BTreeMap::new(),
            history: ExecutionHistory::new(),
            verdict: None,
            outcome: None,
            answer: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_transition(&self, target: RunPhase) -> bool {
        matches!(
            (self.phase, target),
            (RunPhase::Planning, RunPhase::Scheduling)
                | (RunPhase::Planning, RunPhase::Aborted)
                | (RunPhase::Scheduling, RunPhase::Validating)
                | (RunPhase::Scheduling, RunPhase::Aborted)
                | (RunPhase::Validating, RunPhase::Planning)
                | (RunPhase::Validating, RunPhase::Composing)
                | (RunPhase::Validating, RunPhase::Aborted)
        )
    }

    /// Move to `target`, bumping the iteration counter when re-entering
    /// planning from validation.
    pub fn transition(&mut self, target: RunPhase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }

        if self.phase == RunPhase::Validating && target == RunPhase::Planning {
            self.iteration += 1;
        }
        self.phase = target;
        self.touch();
        self.phase_history.push(PhaseHistoryEntry {
            phase: target,
            iteration: self.iteration,
            entered_at: self.updated_at,
        });
        tracing::info!(
            run_id = %self.run_id,
            phase = %target,
            iteration = self.iteration,
            "phase entered"
        );
        Ok(())
    }

    /// Transition to `Aborted` and record why.
    pub fn abort(&mut self, outcome: RunOutcome) -> Result<()> {
        self.transition(RunPhase::Aborted)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Undo a cancellation so the run can continue.
    ///
    /// A run aborted with [`RunOutcome::Cancelled`] returns to the phase it
    /// was in when cancelled, at the same iteration, and loses its composed
    /// answer. Any other state is left alone and `false` is returned.
    pub fn reopen_cancelled(&mut self) -> bool {
        if self.phase != RunPhase::Aborted || self.outcome != Some(RunOutcome::Cancelled) {
            return false;
        }
        let previous = self
            .phase_history
            .iter()
            .rev()
            .map(|entry| entry.phase)
            .find(|phase| !phase.is_terminal())
            .unwrap_or(RunPhase::Planning);

        self.phase = previous;
        self.outcome = None;
        self.answer = None;
        self.touch();
        self.phase_history.push(PhaseHistoryEntry {
            phase: previous,
            iteration: self.iteration,
            entered_at: self.updated_at,
        });
        tracing::info!(
            run_id = %self.run_id,
            phase = %previous,
            iteration = self.iteration,
            "cancelled run reopened"
        );
        true
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn phase_history(&self) -> &[PhaseHistoryEntry] {
        &self.phase_history
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Swap in a freshly planned graph.
    ///
    /// Tasks whose id and fingerprint match a result already carried by the
    /// run adopt it instead of running again. Returns the adopted ids.
    pub fn replace_graph(&mut self, graph: TaskGraph) -> Vec<TaskId> {
        self.graph = graph;
        self.touch();
        self.graph.adopt_results(&self.results)
    }

    /// Copy every succeeded result of the current graph into the carried
    /// results. Returns how many entries were written.
    pub fn absorb_results(&mut self) -> usize {
        let succeeded = self.graph.succeeded_results();
        let count = succeeded.len();
        for (id, (fingerprint, value)) in succeeded {
            self.results.insert(
                id,
                CarriedResult {
                    fingerprint,
                    value,
                    iteration: self.iteration,
                },
            );
        }
        self.touch();
        count
    }

    /// Carried results as a plain `id -> value` map for collaborators.
    pub fn result_values(&self) -> BTreeMap<TaskId, Value> {
        self.results
            .iter()
            .map(|(id, carried)| (id.clone(), carried.value.clone()))
            .collect()
    }

    /// Reset tasks interrupted mid-flight. Returns the reset ids.
    pub fn reset_interrupted(&mut self) -> Vec<TaskId> {
        let reset = self.graph.reset_interrupted();
        if !reset.is_empty() {
            self.touch();
        }
        reset
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
