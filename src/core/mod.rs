//! Core domain models for the execution engine.
//!
//! This module contains the task model, the dependency graph with its
//! resolver, and the call fingerprints used by the result cache.

pub mod dag;
pub mod fingerprint;
pub mod task;

pub use dag::{CarriedResult, StatusCounts, TaskGraph};
pub use fingerprint::Fingerprint;
pub use task::{Task, TaskError, TaskId, TaskSpec, TaskStatus, ToolRef};
