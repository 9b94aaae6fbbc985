//! Orchestration layer for the meshengine execution engine.
//!
//! This module provides the tool registry and invoker, the parallel
//! scheduler, the planner, predicate and composer collaborators, and the
//! engine that ties them into the validator loop.

mod composer;
mod engine;
mod events;
mod invoker;
mod planner;
mod registry;
mod retry;
mod scheduler;
mod validator;

pub use composer::{Composer, JsonSummaryComposer};
pub use engine::{Engine, EngineBuilder};
pub use events::{EngineEvent, EventSink};
pub use invoker::{TaskOutcome, ToolInvoker};
pub use planner::{parse_plan, request_plan, PlanContext, Planner, RawPlan, StaticPlanner};
pub use registry::{Tool, ToolRegistry, ToolRegistryBuilder};
pub use retry::RetryPolicy;
pub use scheduler::{IterationReport, Scheduler};
pub use validator::{parse_verdict, AllSucceeded, CompletionPredicate, RulePredicate};
