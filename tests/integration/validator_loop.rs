//! Iteration budget, re-planning with carried context and planner repair.

use serde_json::json;

use meshengine::core::TaskId;
use meshengine::error::PlanningError;
use meshengine::orchestration::{RawPlan, RulePredicate, ToolRegistry};
use meshengine::workflow::{RunOutcome, RunPhase, Verdict};
use meshengine::{Engine, EngineConfig, EngineEvent};

use crate::fixtures::*;

fn tools() -> ToolRegistry {
    ToolRegistry::builder().register(ScriptedTool::work()).build()
}

#[tokio::test]
async fn test_never_done_runs_exactly_k_planning_cycles() {
    let planner = ScriptedPlanner::repeating(vec![work("a", &[], json!({}))]);
    let seen = planner.seen();
    let tool = ScriptedTool::work();
    let stats = tool.stats();

    let engine = Engine::builder(config(4, 2))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(planner)
        .predicate(NeverDone)
        .build()
        .unwrap();

    let state = engine.run("unreachable").await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert_eq!(
        seen.iter().map(|c| c.iteration).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    let planning_entries = state
        .phase_history()
        .iter()
        .filter(|e| e.phase == RunPhase::Planning)
        .count();
    assert_eq!(planning_entries, 4);
    assert_eq!(state.history.iterations().len(), 4);
    assert_eq!(
        state.outcome,
        Some(RunOutcome::BudgetExhausted { iterations: 4 })
    );
    assert_eq!(state.phase(), RunPhase::Aborted);

    // Later cycles see the verdict and reuse the carried result.
    assert_eq!(seen[0].rationale, None);
    assert_eq!(seen[1].rationale.as_deref(), Some("goal not reached"));
    assert_eq!(seen[1].hints, vec![json!("keep going")]);
    assert_eq!(seen[1].results.get(&TaskId::from("a")), Some(&json!({ "id": "a" })));
    assert_eq!(stats.calls(), 1);
    assert!(state.answer.is_some());
}

#[tokio::test]
async fn test_replan_routes_around_failed_task() {
    let planner = ScriptedPlanner::new(vec![
        Ok(RawPlan::Tasks(vec![work("a", &[], json!({ "fail": true }))])),
        Ok(RawPlan::Tasks(vec![work("b", &[], json!({}))])),
    ]);
    let seen = planner.seen();

    let engine = Engine::builder(config(3, 2))
        .tools(tools())
        .planner(planner)
        .build()
        .unwrap();

    let state = engine.run("route around").await.unwrap();

    assert_eq!(state.outcome, Some(RunOutcome::Completed));
    assert_eq!(state.phase(), RunPhase::Composing);
    assert_eq!(state.iteration(), 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].hints.len(), 1);
    assert_eq!(seen[1].hints[0]["task"], json!("a"));
    assert_eq!(seen[1].hints[0]["status"], json!("failed"));

    // The graph was replaced outright; failed work is not carried.
    assert!(!state.graph.contains_task(&TaskId::from("a")));
    assert!(!state.results.contains_key(&TaskId::from("a")));
    assert!(state.results.contains_key(&TaskId::from("b")));
}

#[tokio::test]
async fn test_malformed_plan_is_repaired() {
    let planner = ScriptedPlanner::new(vec![
        Ok(RawPlan::Text("I will search first, then summarise.".into())),
        Ok(RawPlan::Text(
            "Here is the plan:\n```json\n[{\"id\": \"a\", \"tool\": {\"name\": \"work\", \"args\": {\"id\": \"a\"}}}]\n```"
                .into(),
        )),
    ]);
    let seen = planner.seen();

    let engine = Engine::builder(config(2, 2))
        .tools(tools())
        .planner(planner)
        .build()
        .unwrap();

    let state = engine.run("repair").await.unwrap();

    assert_eq!(state.outcome, Some(RunOutcome::Completed));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].repair.is_none());
    assert!(seen[1].repair.is_some());
    assert_eq!(seen[1].iteration, 0);
}

#[tokio::test]
async fn test_repair_exhaustion_fails_planning_but_composes() {
    let planner = ScriptedPlanner::new(vec![Ok(RawPlan::Text("no plan here".into()))]);
    let seen = planner.seen();
    let config = EngineConfig {
        planner_repair_attempts: 1,
        ..config(3, 2)
    };

    let engine = Engine::builder(config)
        .tools(tools())
        .planner(planner)
        .build()
        .unwrap();

    let state = engine.run("hopeless").await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(state.phase(), RunPhase::Aborted);
    assert!(matches!(
        state.outcome,
        Some(RunOutcome::PlanningFailed { .. })
    ));
    assert!(state.answer.is_some());
}

#[tokio::test]
async fn test_planner_error_is_not_repaired() {
    let planner = ScriptedPlanner::new(vec![Err(PlanningError::Planner("offline".into()))]);
    let seen = planner.seen();

    let engine = Engine::builder(config(3, 2))
        .tools(tools())
        .planner(planner)
        .build()
        .unwrap();

    let state = engine.run("offline").await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(
        state.outcome,
        Some(RunOutcome::PlanningFailed {
            error: "planner error: offline".into()
        })
    );
}

#[tokio::test]
async fn test_rule_predicate_with_fallback() {
    let planner = ScriptedPlanner::new(vec![
        Ok(RawPlan::Tasks(vec![work("a", &[], json!({}))])),
        Ok(RawPlan::Tasks(vec![
            work("a", &[], json!({})),
            work("b", &["a"], json!({})),
        ])),
    ]);
    let tool = ScriptedTool::work();
    let stats = tool.stats();
    let predicate = RulePredicate::new()
        .rule(|state| {
            state
                .results
                .contains_key(&TaskId::from("b"))
                .then(|| Verdict::done("b produced"))
        })
        .fallback(NeverDone);

    let engine = Engine::builder(config(3, 2))
        .tools(ToolRegistry::builder().register(tool).build())
        .planner(planner)
        .predicate(predicate)
        .build()
        .unwrap();

    let state = engine.run("rules").await.unwrap();

    assert_eq!(state.outcome, Some(RunOutcome::Completed));
    assert_eq!(state.verdict.as_ref().unwrap().rationale, "b produced");
    // `a` was adopted on the second cycle instead of being called again.
    assert_eq!(stats.calls(), 2);
    assert_eq!(state.history.tool_calls(), 2);
}

#[tokio::test]
async fn test_phase_events_follow_the_loop() {
    let (tx, mut rx) = event_channel();
    let engine = Engine::builder(config(3, 2))
        .tools(tools())
        .planner(ScriptedPlanner::repeating(vec![work("a", &[], json!({}))]))
        .events(tx)
        .build()
        .unwrap();

    let state = engine.run("events").await.unwrap();
    let events = drain(&mut rx);

    let phases: Vec<(RunPhase, u32)> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::PhaseEntered {
                phase, iteration, ..
            } => Some((*phase, *iteration)),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            (RunPhase::Planning, 0),
            (RunPhase::Scheduling, 0),
            (RunPhase::Validating, 0),
            (RunPhase::Composing, 0),
        ]
    );
    assert_eq!(
        events.last(),
        Some(&EngineEvent::RunFinished {
            run_id: state.run_id,
            outcome: RunOutcome::Completed,
        })
    );
}
