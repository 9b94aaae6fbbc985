//! The validator loop.
//!
//! [`Engine`] drives an [`ExecutionState`] through
//! Planning -> Scheduling -> Validating until the completion predicate
//! reports done, the iteration budget runs out, planning fails or the run
//! is cancelled. Whatever the ending, the composer receives the final state.
//!
//! Checkpoints are written at the end of every scheduling pass and on entry
//! to and exit from the terminal phases, never while tasks are running.

use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::TaskGraph;
use crate::error::{Error, Result};
use crate::state::{CheckpointStore, ResultCache};
use crate::workflow::{ExecutionState, RunId, RunOutcome, RunPhase, Verdict};

use super::{
    request_plan, AllSucceeded, CompletionPredicate, Composer, EngineEvent, EventSink,
    JsonSummaryComposer, PlanContext, Planner, Scheduler, ToolInvoker, ToolRegistry,
};

pub struct Engine {
    config: EngineConfig,
    planner: Box<dyn Planner>,
    predicate: Box<dyn CompletionPredicate>,
    composer: Box<dyn Composer>,
    scheduler: Scheduler,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    events: EventSink,
    cancel: CancellationToken,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.scheduler.invoker().cache()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop dispatching new tasks. The run aborts once in-flight tasks finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Start a new run toward `goal`.
    pub async fn run(&self, goal: impl Into<String>) -> Result<ExecutionState> {
        let state = ExecutionState::new(goal);
        tracing::info!(run_id = %state.run_id, goal = %state.goal, "run started");
        self.drive(state).await
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// A cancelled run picks up in the phase it was interrupted in. A run
    /// that ended any other way is returned as checkpointed.
    pub async fn resume(&self, run_id: RunId) -> Result<ExecutionState> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| Error::Config("resume requires a checkpoint store".into()))?;
        let mut state = store.load(run_id)?;
        state.reopen_cancelled();
        tracing::info!(
            run_id = %run_id,
            phase = %state.phase(),
            iteration = state.iteration(),
            "resuming run"
        );
        if state.is_finished() && state.answer.is_some() {
            return Ok(state);
        }
        self.drive(state).await
    }

    async fn drive(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        let mut announced = None;
        loop {
            let phase = state.phase();
            if announced != Some((phase, state.iteration())) {
                announced = Some((phase, state.iteration()));
                self.events
                    .emit(EngineEvent::PhaseEntered {
                        run_id: state.run_id,
                        phase,
                        iteration: state.iteration(),
                    })
                    .await;
            }
            if !phase.is_terminal() && phase != RunPhase::Scheduling && self.cancel.is_cancelled()
            {
                state.abort(RunOutcome::Cancelled)?;
                continue;
            }
            match phase {
                RunPhase::Planning => self.plan(&mut state).await?,
                RunPhase::Scheduling => self.schedule(&mut state).await?,
                RunPhase::Validating => self.validate(&mut state).await?,
                RunPhase::Composing | RunPhase::Aborted => break,
            }
        }
        self.finish(&mut state).await?;
        Ok(state)
    }

    async fn plan(&self, state: &mut ExecutionState) -> Result<()> {
        let iteration = state.iteration();
        state.history.iteration_mut(iteration);

        let verdict = state.verdict.clone();
        let context = PlanContext {
            goal: state.goal.clone(),
            iteration,
            results: state.result_values(),
            rationale: verdict.as_ref().map(|v| v.rationale.clone()),
            hints: verdict.map(|v| v.hints).unwrap_or_default(),
            repair: None,
        };

        let specs = match request_plan(
            self.planner.as_ref(),
            &context,
            self.config.planner_repair_attempts,
        )
        .await
        {
            Ok(specs) => specs,
            Err(err) => {
                tracing::error!(run_id = %state.run_id, iteration, error = %err, "planning failed");
                return state.abort(RunOutcome::PlanningFailed {
                    error: err.to_string(),
                });
            }
        };

        let graph = match TaskGraph::build(specs) {
            Ok(graph) => graph,
            Err(err) => {
                tracing::error!(
                    run_id = %state.run_id,
                    iteration,
                    error = %err,
                    "invalid task graph"
                );
                return state.abort(RunOutcome::ConstructionFailed {
                    error: err.to_string(),
                });
            }
        };

        let planned = graph.task_count();
        let adopted = state.replace_graph(graph);
        state.history.iteration_mut(iteration).planned = planned;
        tracing::info!(
            run_id = %state.run_id,
            iteration,
            planned,
            adopted = adopted.len(),
            "plan accepted"
        );
        state.transition(RunPhase::Scheduling)
    }

    async fn schedule(&self, state: &mut ExecutionState) -> Result<()> {
        let iteration = state.iteration();
        let report = self.scheduler.run_iteration(&mut state.graph).await?;

        state.history.record_invocations(iteration, report.records);
        state.absorb_results();
        state.history.iteration_mut(iteration).counts = state.graph.status_counts();
        self.checkpoint(state).await;

        if report.cancelled || self.cancel.is_cancelled() {
            tracing::info!(run_id = %state.run_id, iteration, "run cancelled");
            return state.abort(RunOutcome::Cancelled);
        }
        state.transition(RunPhase::Validating)
    }

    async fn validate(&self, state: &mut ExecutionState) -> Result<()> {
        let iteration = state.iteration();
        let verdict = match self.predicate.is_done(state).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    iteration,
                    error = %err,
                    "completion predicate failed"
                );
                Verdict::not_done(format!("completion predicate failed: {}", err))
            }
        };
        tracing::info!(
            run_id = %state.run_id,
            iteration,
            done = verdict.done,
            rationale = %verdict.rationale,
            "validation verdict"
        );

        let record = state.history.iteration_mut(iteration);
        record.verdict = Some(verdict.clone());
        record.finished_at = Some(chrono::Utc::now());
        let done = verdict.done;
        state.verdict = Some(verdict);

        if done {
            state.outcome = Some(RunOutcome::Completed);
            state.transition(RunPhase::Composing)
        } else if iteration + 1 >= self.config.max_iterations {
            tracing::warn!(
                run_id = %state.run_id,
                iterations = iteration + 1,
                "iteration budget exhausted"
            );
            state.abort(RunOutcome::BudgetExhausted {
                iterations: iteration + 1,
            })
        } else {
            state.transition(RunPhase::Planning)
        }
    }

    /// Hand the terminal state to the composer, checkpointing around it.
    async fn finish(&self, state: &mut ExecutionState) -> Result<()> {
        self.checkpoint(state).await;

        let composed = self.composer.compose(state).await;
        let result = match composed {
            Ok(answer) => {
                state.answer = Some(answer);
                Ok(())
            }
            Err(err) => {
                tracing::error!(run_id = %state.run_id, error = %err, "composer failed");
                Err(Error::Composer(err.to_string()))
            }
        };

        self.checkpoint(state).await;
        let outcome = state.outcome.clone().unwrap_or(RunOutcome::Completed);
        tracing::info!(run_id = %state.run_id, outcome = %outcome, "run finished");
        self.events
            .emit(EngineEvent::RunFinished {
                run_id: state.run_id,
                outcome,
            })
            .await;
        result
    }

    async fn checkpoint(&self, state: &ExecutionState) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        match store.save(state.run_id, state.iteration(), state) {
            Ok(()) => {
                self.events
                    .emit(EngineEvent::CheckpointSaved {
                        run_id: state.run_id,
                        iteration: state.iteration(),
                    })
                    .await;
            }
            Err(err) => {
                tracing::error!(run_id = %state.run_id, error = %err, "checkpoint write failed");
            }
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    tools: ToolRegistry,
    planner: Option<Box<dyn Planner>>,
    predicate: Option<Box<dyn CompletionPredicate>>,
    composer: Option<Box<dyn Composer>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    cache: Option<Arc<ResultCache>>,
    events: EventSink,
    cancel: CancellationToken,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            tools: ToolRegistry::default(),
            planner: None,
            predicate: None,
            composer: None,
            checkpoints: None,
            cache: None,
            events: EventSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn planner(mut self, planner: impl Planner + 'static) -> Self {
        self.planner = Some(Box::new(planner));
        self
    }

    /// Completion predicate. Defaults to [`AllSucceeded`].
    pub fn predicate(mut self, predicate: impl CompletionPredicate + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Composer. Defaults to [`JsonSummaryComposer`].
    pub fn composer(mut self, composer: impl Composer + 'static) -> Self {
        self.composer = Some(Box::new(composer));
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Share an existing cache instead of building one from the config.
    pub fn cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn events(mut self, tx: mpsc::Sender<EngineEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let planner = self
            .planner
            .ok_or_else(|| Error::Config("engine requires a planner".into()))?;

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.config.cache.enabled => Some(Arc::new(ResultCache::new(
                self.config.cache.capacity.and_then(NonZeroUsize::new),
                self.config.cache_ttl(),
            ))),
            None => None,
        };
        let mut invoker = ToolInvoker::new(
            self.tools,
            self.config.retry_policy(),
            self.config.tool_timeout(),
        );
        if let Some(cache) = cache {
            invoker = invoker.with_cache(cache);
        }
        let scheduler = Scheduler::new(invoker, self.config.concurrency_limit)
            .with_events(self.events.clone())
            .with_cancellation(self.cancel.clone());

        Ok(Engine {
            planner,
            predicate: self.predicate.unwrap_or_else(|| Box::new(AllSucceeded)),
            composer: self
                .composer
                .unwrap_or_else(|| Box::new(JsonSummaryComposer)),
            scheduler,
            checkpoints: self.checkpoints,
            events: self.events,
            cancel: self.cancel,
            config: self.config,
        })
    }
}
