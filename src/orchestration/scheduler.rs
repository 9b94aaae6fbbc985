//! Scheduler for parallel task execution.
//!
//! The Scheduler drives one iteration of a task graph: it cascades skips
//! from failed tasks, dispatches the ready set through the tool invoker up
//! to the concurrency limit, and folds each completion back into the graph.
//! All graph mutation happens on the scheduler's own task; workers only
//! invoke tools and hand back a [`TaskOutcome`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{TaskError, TaskGraph, TaskId, TaskStatus, ToolRef};
use crate::error::{Result, ToolError};
use crate::state::{InvocationOutcome, InvocationRecord};

use super::{EngineEvent, EventSink, TaskOutcome, ToolInvoker};

/// What happened during one scheduling pass.
///
/// Returned by [`Scheduler::run_iteration`]. The graph itself carries each
/// task's final status; the report lists what this pass did to get there.
#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    /// Tasks whose tool was dispatched, in dispatch order.
    ///
    /// Tasks that adopted a carried result are never dispatched and do not
    /// appear here.
    pub dispatched: Vec<TaskId>,
    /// Tasks skipped because a dependency failed, in cascade order.
    pub skipped: Vec<TaskId>,
    /// Invocation records from every dispatched task, one per attempt or
    /// cache hit, in completion order.
    ///
    /// A worker that panics still leaves one failed record.
    pub records: Vec<InvocationRecord>,
    /// Set when cancellation stopped new dispatches.
    pub cancelled: bool,
}

/// A dispatched task the scheduler is waiting on.
struct Running {
    task_id: TaskId,
    tool: ToolRef,
    attempt: u32,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl Running {
    /// The failed record for a worker that never returned its own.
    fn panicked(self, message: String) -> TaskOutcome {
        let record = InvocationRecord {
            task_id: self.task_id.clone(),
            iteration: 0,
            attempt: self.attempt,
            tool: self.tool.name.clone(),
            fingerprint: self.tool.fingerprint(),
            started_at: self.started_at,
            duration: self.clock.elapsed(),
            outcome: InvocationOutcome::Failed {
                error: message.clone(),
                transient: false,
            },
        };
        TaskOutcome {
            task_id: self.task_id,
            attempt: self.attempt,
            result: Err(ToolError::Permanent(message)),
            records: vec![record],
        }
    }
}

/// Runs the ready tasks of a [`TaskGraph`] through a [`ToolInvoker`].
///
/// The scheduler is the only writer of the graph while a pass is running.
/// Each ready task is started on the graph, then its invocation is spawned
/// on a [`JoinSet`]. At most `concurrency_limit` invocations are in flight
/// at once. As each one joins, its result is folded back into the graph and
/// newly ready tasks are dispatched.
///
/// # Events
///
/// When an [`EventSink`] is attached the scheduler emits, in order per task:
/// - `TaskStarted` when the task is dispatched
/// - `Invocation` for each attempt record
/// - `TaskFinished` once the result is applied
///
/// and `TaskSkipped` for each task removed by a failed dependency.
///
/// # Cancellation
///
/// Once the cancellation token fires no new task starts. Tasks already in
/// flight run to completion and are recorded normally.
pub struct Scheduler {
    invoker: ToolInvoker,
    /// Maximum invocations in flight; always at least one.
    concurrency_limit: usize,
    events: EventSink,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler around `invoker`.
    ///
    /// A concurrency limit of zero is treated as one. Events are disabled
    /// and the scheduler gets its own cancellation token until
    /// [`with_events`](Self::with_events) and
    /// [`with_cancellation`](Self::with_cancellation) replace them.
    pub fn new(invoker: ToolInvoker, concurrency_limit: usize) -> Self {
        Self {
            invoker,
            concurrency_limit: concurrency_limit.max(1),
            events: EventSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    /// Emit task events to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Share `cancel` with the caller, typically the engine.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    /// Run `graph` until nothing more can start and nothing is in flight.
    ///
    /// Stops early, after in-flight tasks finish, once the cancellation
    /// token fires. Task failures never surface as an `Err`; they are
    /// recorded on the task and cascade as skips.
    pub async fn run_iteration(&self, graph: &mut TaskGraph) -> Result<IterationReport> {
        let mut report = IterationReport::default();
        let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, Running> = HashMap::new();

        loop {
            self.cascade(graph, &mut report).await;

            if self.cancel.is_cancelled() {
                if !report.cancelled {
                    tracing::info!(in_flight = in_flight.len(), "cancelled, no new tasks start");
                }
                report.cancelled = true;
            } else {
                self.dispatch(graph, &mut in_flight, &mut running, &mut report)
                    .await?;
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    running.remove(&id);
                    outcome
                }
                Err(err) => {
                    let Some(task) = running.remove(&err.id()) else {
                        continue;
                    };
                    tracing::error!(task_id = %task.task_id, error = %err, "tool worker panicked");
                    task.panicked(format!("tool worker panicked: {}", err))
                }
            };
            self.complete(graph, outcome, &mut report).await?;
        }

        let counts = graph.status_counts();
        tracing::info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            unfinished = counts.unfinished(),
            "scheduling pass finished"
        );
        Ok(report)
    }

    async fn cascade(&self, graph: &mut TaskGraph, report: &mut IterationReport) {
        for task_id in graph.cascade_skips() {
            let dependency = graph
                .get_task(&task_id)
                .and_then(|t| match &t.error {
                    Some(TaskError::UpstreamFailed { dependency }) => {
                        Some(dependency.clone())
                    }
                    _ => None,
                })
                .unwrap_or_else(|| task_id.clone());
            tracing::debug!(task_id = %task_id, dependency = %dependency, "task skipped");
            self.events
                .emit(EngineEvent::TaskSkipped {
                    task_id: task_id.clone(),
                    dependency,
                })
                .await;
            report.skipped.push(task_id);
        }
    }

    async fn dispatch(
        &self,
        graph: &mut TaskGraph,
        in_flight: &mut JoinSet<TaskOutcome>,
        running: &mut HashMap<tokio::task::Id, Running>,
        report: &mut IterationReport,
    ) -> Result<()> {
        for task_id in graph.refresh_ready() {
            if in_flight.len() >= self.concurrency_limit {
                break;
            }
            let started = graph.start_task(&task_id)?;
            let tool = started.tool.clone();
            let attempt = started.attempt + 1;
            tracing::debug!(task_id = %task_id, tool = %tool.name, "task dispatched");
            self.events
                .emit(EngineEvent::TaskStarted {
                    task_id: task_id.clone(),
                })
                .await;

            let invoker = self.invoker.clone();
            let worker_id = task_id.clone();
            let worker_tool = tool.clone();
            let handle =
                in_flight.spawn(async move { invoker.invoke(&worker_id, &worker_tool).await });
            running.insert(
                handle.id(),
                Running {
                    task_id: task_id.clone(),
                    tool,
                    attempt,
                    started_at: Utc::now(),
                    clock: Instant::now(),
                },
            );
            report.dispatched.push(task_id);
        }
        Ok(())
    }

    async fn complete(
        &self,
        graph: &mut TaskGraph,
        outcome: TaskOutcome,
        report: &mut IterationReport,
    ) -> Result<()> {
        let TaskOutcome {
            task_id,
            attempt,
            result,
            records,
        } = outcome;

        for record in &records {
            self.events.emit(EngineEvent::Invocation(record.clone())).await;
        }
        report.records.extend(records);

        if !graph.finish_task(&task_id, attempt, &result)? {
            tracing::debug!(task_id = %task_id, "duplicate completion ignored");
            return Ok(());
        }
        let status = graph
            .get_task(&task_id)
            .map_or(TaskStatus::Failed, |t| t.status);
        tracing::debug!(task_id = %task_id, %status, attempt, "task finished");
        self.events
            .emit(EngineEvent::TaskFinished { task_id, status })
            .await;
        Ok(())
    }
}
