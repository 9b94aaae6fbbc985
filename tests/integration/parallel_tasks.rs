//! Concurrent dispatch, dependency ordering and cascading skips.

use serde_json::json;
use std::time::Duration;

use meshengine::core::{TaskError, TaskId, TaskSpec, TaskStatus, ToolRef};
use meshengine::orchestration::{StaticPlanner, ToolRegistry};
use meshengine::workflow::{RunOutcome, RunPhase};
use meshengine::{Engine, EngineEvent};

use crate::fixtures::*;

fn slow(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec::new(id, ToolRef::new("slow", json!({ "id": id }))).depends_on(deps)
}

fn status(state: &meshengine::ExecutionState, id: &str) -> TaskStatus {
    state.graph.get_task(&TaskId::from(id)).unwrap().status
}

#[tokio::test(start_paused = true)]
async fn test_independent_tasks_run_together_and_join() {
    let tool = ScriptedTool::new("slow", |args, _| Ok(args.clone()))
        .with_delay(Duration::from_millis(100));
    let stats = tool.stats();
    let (tx, mut rx) = event_channel();

    let engine = Engine::builder(config(1, 4))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(StaticPlanner::new(vec![
            slow("a", &[]),
            slow("b", &[]),
            slow("c", &["a", "b"]),
        ]))
        .events(tx)
        .build()
        .unwrap();

    let state = engine.run("join").await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(state.outcome, Some(RunOutcome::Completed));
    assert_eq!(stats.calls(), 3);
    assert_eq!(stats.peak(), 2);

    // Both roots are in flight before either finishes.
    let first_finish = position(&events, finished("a")).min(position(&events, finished("b")));
    assert!(position(&events, started("a")) < first_finish);
    assert!(position(&events, started("b")) < first_finish);

    let c_started = position(&events, started("c"));
    assert!(c_started > position(&events, finished("a")));
    assert!(c_started > position(&events, finished("b")));
    assert_dependency_order(&events, &state.graph);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_skips_dependent_and_reaches_validation() {
    let slow_tool = ScriptedTool::new("slow", |args, _| Ok(args.clone()))
        .with_delay(Duration::from_millis(100));
    let slow_stats = slow_tool.stats();
    let (tx, mut rx) = event_channel();

    let engine = Engine::builder(config(1, 4))
        .tools(
            ToolRegistry::builder()
                .register(ScriptedTool::work())
                .register(slow_tool)
                .build(),
        )
        .planner(StaticPlanner::new(vec![
            work("a", &[], json!({ "fail": true })),
            slow("b", &[]),
            work("c", &["a", "b"], json!({})),
        ]))
        .events(tx)
        .build()
        .unwrap();

    let state = engine.run("partial").await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(status(&state, "a"), TaskStatus::Failed);
    assert_eq!(status(&state, "b"), TaskStatus::Succeeded);
    assert_eq!(status(&state, "c"), TaskStatus::Skipped);
    assert_eq!(slow_stats.calls(), 1);

    let c = state.graph.get_task(&TaskId::from("c")).unwrap();
    assert_eq!(
        c.error,
        Some(TaskError::UpstreamFailed {
            dependency: TaskId::from("a")
        })
    );
    assert!(!events.iter().any(started("c")));
    assert!(events.contains(&EngineEvent::TaskSkipped {
        task_id: TaskId::from("c"),
        dependency: TaskId::from("a"),
    }));

    // The run still validated, then ran out of budget with partial results.
    assert!(state
        .phase_history()
        .iter()
        .any(|entry| entry.phase == RunPhase::Validating));
    assert_eq!(
        state.outcome,
        Some(RunOutcome::BudgetExhausted { iterations: 1 })
    );
    let verdict = state.verdict.as_ref().unwrap();
    assert!(!verdict.done);
    assert_eq!(
        verdict.rationale,
        "1 of 3 tasks succeeded (1 failed, 1 skipped, 0 unfinished)"
    );
    assert!(state.results.contains_key(&TaskId::from("b")));
    assert!(state.answer.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_dependency_order_holds_across_mixed_graph() {
    let slow_tool = ScriptedTool::new("slow", |args, _| Ok(args.clone()))
        .with_delay(Duration::from_millis(30));
    let (tx, mut rx) = event_channel();

    let engine = Engine::builder(config(1, 3))
        .tools(
            ToolRegistry::builder()
                .register(ScriptedTool::work())
                .register(slow_tool)
                .build(),
        )
        .planner(StaticPlanner::new(vec![
            slow("a", &[]),
            work("b", &["a"], json!({})),
            work("c", &[], json!({})),
            slow("d", &["b", "c"]),
            work("e", &["d"], json!({})),
            work("f", &[], json!({ "fail": true })),
            work("g", &["f"], json!({})),
            slow("h", &["g", "c"]),
        ]))
        .events(tx)
        .build()
        .unwrap();

    let state = engine.run("mixed").await.unwrap();
    let events = drain(&mut rx);

    assert_dependency_order(&events, &state.graph);
    for id in ["a", "b", "c", "d", "e"] {
        assert_eq!(status(&state, id), TaskStatus::Succeeded, "task {}", id);
    }
    assert_eq!(status(&state, "f"), TaskStatus::Failed);
    assert_eq!(status(&state, "g"), TaskStatus::Skipped);
    assert_eq!(status(&state, "h"), TaskStatus::Skipped);
    assert!(state.graph.all_finished());
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_bounds_in_flight_calls() {
    let tool = ScriptedTool::new("slow", |args, _| Ok(args.clone()))
        .with_delay(Duration::from_millis(100));
    let stats = tool.stats();

    let engine = Engine::builder(config(1, 2))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(StaticPlanner::new(
            (0..6).map(|i| slow(&format!("t{}", i), &[])).collect(),
        ))
        .build()
        .unwrap();

    let start = tokio::time::Instant::now();
    let state = engine.run("bounded").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(state.outcome, Some(RunOutcome::Completed));
    assert_eq!(stats.calls(), 6);
    assert_eq!(stats.peak(), 2);
    // Three waves of two.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "elapsed {:?}", elapsed);
}
