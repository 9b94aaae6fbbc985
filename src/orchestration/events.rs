//! Engine lifecycle events.
//!
//! These events let a trace collaborator follow a run without polling.
//! They mirror what the execution history records but arrive live.

use tokio::sync::mpsc;

use crate::core::{TaskId, TaskStatus};
use crate::state::InvocationRecord;
use crate::workflow::{RunId, RunOutcome, RunPhase};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PhaseEntered {
        run_id: RunId,
        phase: RunPhase,
        iteration: u32,
    },
    /// A task moved to running and its invocation was dispatched.
    TaskStarted { task_id: TaskId },
    /// A task reached a terminal status.
    TaskFinished { task_id: TaskId, status: TaskStatus },
    /// A task was skipped because `dependency` failed.
    TaskSkipped { task_id: TaskId, dependency: TaskId },
    Invocation(InvocationRecord),
    CheckpointSaved { run_id: RunId, iteration: u32 },
    RunFinished { run_id: RunId, outcome: RunOutcome },
}

/// Optional event channel. Sending never fails the run.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
