//! Retry counts, backoff doubling and call timeouts, on a paused clock.

use serde_json::json;
use std::time::Duration;

use meshengine::core::{TaskError, TaskId, TaskSpec, TaskStatus, ToolRef};
use meshengine::error::ToolError;
use meshengine::orchestration::{StaticPlanner, ToolRegistry};
use meshengine::state::InvocationOutcome;
use meshengine::workflow::RunOutcome;
use meshengine::{Engine, EngineConfig, ExecutionState};

use crate::fixtures::*;

fn retry_config(max_attempts: u32, base_ms: u64, max_ms: u64) -> EngineConfig {
    let mut config = config(1, 4);
    config.retry.max_attempts = max_attempts;
    config.retry.base_delay_ms = base_ms;
    config.retry.max_delay_ms = max_ms;
    config
}

async fn run_timed(engine: &Engine) -> (ExecutionState, Duration) {
    let start = tokio::time::Instant::now();
    let state = engine.run("retry").await.unwrap();
    (state, start.elapsed())
}

fn retry_delays(state: &ExecutionState, id: &str) -> Vec<Duration> {
    state
        .history
        .for_task(&TaskId::from(id))
        .filter_map(|record| match &record.outcome {
            InvocationOutcome::Retrying { retry_in, .. } => Some(*retry_in),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_fails_after_max_attempts_with_doubling_backoff() {
    let tool = ScriptedTool::work();
    let stats = tool.stats();
    let engine = Engine::builder(retry_config(4, 100, 250))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(StaticPlanner::new(vec![work("a", &[], json!({ "flaky": true }))]))
        .build()
        .unwrap();

    let (state, elapsed) = run_timed(&engine).await;

    assert_eq!(stats.calls(), 4);
    let a = state.graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.attempt, 4);
    assert!(matches!(
        &a.error,
        Some(TaskError::Tool { transient: true, .. })
    ));

    // 100ms, doubled to 200ms, then capped at 250ms.
    assert_eq!(
        retry_delays(&state, "a"),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(250),
        ]
    );
    assert_elapsed(elapsed, Duration::from_millis(550));

    let attempts: Vec<u32> = state
        .history
        .for_task(&TaskId::from("a"))
        .map(|r| r.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    let last = state.history.for_task(&TaskId::from("a")).last().unwrap();
    assert!(matches!(
        last.outcome,
        InvocationOutcome::Failed {
            transient: true,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let tool = ScriptedTool::new("work", |args, call| {
        if call < 3 {
            Err(ToolError::Transient("rate limited".into()))
        } else {
            Ok(args.clone())
        }
    });
    let stats = tool.stats();
    let engine = Engine::builder(retry_config(5, 100, 1_000))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(StaticPlanner::new(vec![work("a", &[], json!({}))]))
        .build()
        .unwrap();

    let (state, elapsed) = run_timed(&engine).await;

    assert_eq!(state.outcome, Some(RunOutcome::Completed));
    assert_eq!(stats.calls(), 3);
    let a = state.graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Succeeded);
    assert_eq!(a.attempt, 3);
    assert_elapsed(elapsed, Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let tool = ScriptedTool::work();
    let stats = tool.stats();
    let engine = Engine::builder(retry_config(5, 100, 1_000))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(StaticPlanner::new(vec![work("a", &[], json!({ "fail": true }))]))
        .build()
        .unwrap();

    let (state, elapsed) = run_timed(&engine).await;

    assert_eq!(stats.calls(), 1);
    assert_elapsed(elapsed, Duration::ZERO);
    assert!(retry_delays(&state, "a").is_empty());
    let a = state.graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_fails_without_retry() {
    let engine = Engine::builder(retry_config(5, 100, 1_000))
        .tools(ToolRegistry::builder().register(ScriptedTool::work()).build())
        .planner(StaticPlanner::new(vec![TaskSpec::new(
            "a",
            ToolRef::new("missing", json!({})),
        )]))
        .build()
        .unwrap();

    let (state, elapsed) = run_timed(&engine).await;

    assert_elapsed(elapsed, Duration::ZERO);
    let a = state.graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(a.error.as_ref().unwrap().to_string().contains("missing"));
}

#[tokio::test(start_paused = true)]
async fn test_per_task_timeout_is_retried_as_transient() {
    let tool = ScriptedTool::new("hang", |args, _| Ok(args.clone()))
        .with_delay(Duration::from_secs(5));
    let stats = tool.stats();
    let mut tool_ref = ToolRef::new("hang", json!({}));
    tool_ref.timeout_ms = Some(1_000);

    let engine = Engine::builder(retry_config(2, 100, 1_000))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(StaticPlanner::new(vec![TaskSpec::new("a", tool_ref)]))
        .build()
        .unwrap();

    let (state, elapsed) = run_timed(&engine).await;

    assert_eq!(stats.calls(), 2);
    // Two timed-out attempts with one backoff between them.
    assert_elapsed(elapsed, Duration::from_millis(2_100));
    let a = state.graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(a.error.as_ref().unwrap().to_string().contains("timed out"));
}
