//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted tools with call and concurrency accounting
//! - Scripted planners that record the context they were given
//! - Event collection and the dependency ordering check

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use meshengine::core::{TaskGraph, TaskId, TaskSpec, TaskStatus, ToolRef};
use meshengine::error::{PlanningError, ToolError, ValidationError};
use meshengine::orchestration::{CompletionPredicate, PlanContext, Planner, RawPlan, Tool};
use meshengine::workflow::{ExecutionState, Verdict};
use meshengine::{EngineConfig, EngineEvent};

/// Shared counters for a [`ScriptedTool`].
#[derive(Debug, Default)]
pub struct ToolStats {
    calls: AtomicU32,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ToolStats {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

type Behavior = Box<dyn Fn(&Value, u32) -> Result<Value, ToolError> + Send + Sync>;

/// A tool whose result is computed from its arguments and the call number.
pub struct ScriptedTool {
    name: String,
    delay: Duration,
    behavior: Behavior,
    stats: Arc<ToolStats>,
}

impl ScriptedTool {
    pub fn new<F>(name: &str, behavior: F) -> Self
    where
        F: Fn(&Value, u32) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            behavior: Box::new(behavior),
            stats: Arc::new(ToolStats::default()),
        }
    }

    /// Tool named `work`.
    ///
    /// Echoes its arguments, unless they carry `"fail": true` (permanent
    /// failure) or `"flaky": true` (transient failure on every call).
    pub fn work() -> Self {
        Self::new("work", |args, _| {
            if args["fail"] == json!(true) {
                return Err(ToolError::Permanent(format!("{} refused", args["id"])));
            }
            if args["flaky"] == json!(true) {
                return Err(ToolError::Transient("service unavailable".into()));
            }
            Ok(args.clone())
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn stats(&self) -> Arc<ToolStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: &Value) -> Result<Value, ToolError> {
        let call = self.stats.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.behavior)(args, call)
    }
}

/// Replays planner responses in order, repeating the last one.
pub struct ScriptedPlanner {
    responses: Mutex<VecDeque<Result<RawPlan, PlanningError>>>,
    seen: Arc<Mutex<Vec<PlanContext>>>,
}

impl ScriptedPlanner {
    pub fn new(responses: Vec<Result<RawPlan, PlanningError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn repeating(specs: Vec<TaskSpec>) -> Self {
        Self::new(vec![Ok(RawPlan::Tasks(specs))])
    }

    /// Every context this planner was asked with, in order.
    pub fn seen(&self) -> Arc<Mutex<Vec<PlanContext>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, context: &PlanContext) -> Result<RawPlan, PlanningError> {
        self.seen.lock().unwrap().push(context.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses
                .front()
                .cloned()
                .unwrap_or_else(|| Err(PlanningError::Planner("script exhausted".into())))
        }
    }
}

/// Predicate that is never satisfied.
pub struct NeverDone;

#[async_trait]
impl CompletionPredicate for NeverDone {
    async fn is_done(&self, _state: &ExecutionState) -> Result<Verdict, ValidationError> {
        Ok(Verdict::not_done("goal not reached").with_hints(vec![json!("keep going")]))
    }
}

/// Task `id` calling the `work` tool with `{"id": id}` merged into `extra`.
pub fn work(id: &str, deps: &[&str], extra: Value) -> TaskSpec {
    let mut args = json!({ "id": id });
    if let (Some(args), Value::Object(extra)) = (args.as_object_mut(), extra) {
        args.extend(extra);
    }
    TaskSpec::new(id, ToolRef::new("work", args)).depends_on(deps)
}

pub fn config(max_iterations: u32, concurrency_limit: usize) -> EngineConfig {
    let mut config = EngineConfig {
        max_iterations,
        concurrency_limit,
        ..EngineConfig::default()
    };
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1_000;
    config
}

pub fn event_channel() -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    mpsc::channel(4096)
}

/// Drain everything already sent on `rx`.
pub fn drain(rx: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Assert that no task started before each of its dependencies finished
/// as succeeded or skipped.
pub fn assert_dependency_order(events: &[EngineEvent], graph: &TaskGraph) {
    let mut finished: HashMap<TaskId, TaskStatus> = HashMap::new();
    for event in events {
        match event {
            EngineEvent::TaskFinished { task_id, status } => {
                finished.insert(task_id.clone(), *status);
            }
            EngineEvent::TaskSkipped { task_id, .. } => {
                finished.insert(task_id.clone(), TaskStatus::Skipped);
            }
            EngineEvent::TaskStarted { task_id } => {
                for dep in graph.dependencies(task_id) {
                    let status = finished.get(&dep.id);
                    assert!(
                        status.is_some_and(|s| s.unblocks_dependents()),
                        "{} started before dependency {} finished (status {:?})",
                        task_id,
                        dep.id,
                        status
                    );
                }
            }
            _ => {}
        }
    }
}

/// Position of the first event matching `pred`.
pub fn position(events: &[EngineEvent], pred: impl Fn(&EngineEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .expect("expected event was not emitted")
}

pub fn started(id: &str) -> impl Fn(&EngineEvent) -> bool + '_ {
    move |e| matches!(e, EngineEvent::TaskStarted { task_id } if task_id.as_str() == id)
}

pub fn finished(id: &str) -> impl Fn(&EngineEvent) -> bool + '_ {
    move |e| matches!(e, EngineEvent::TaskFinished { task_id, .. } if task_id.as_str() == id)
}

/// Paused-clock timers fire on millisecond ticks, so allow a little slack.
pub fn assert_elapsed(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(20),
        "elapsed {:?}, expected about {:?}",
        elapsed,
        expected
    );
}
