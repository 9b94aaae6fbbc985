//! Run lifecycle types for the meshengine validator loop.
//!
//! This module provides the run identifiers, phases and outcomes, plus the
//! phase-guarded `ExecutionState` that the engine drives.

mod state;
mod types;

pub use state::{ExecutionState, PhaseHistoryEntry};
pub use types::{RunId, RunOutcome, RunPhase, Verdict};
