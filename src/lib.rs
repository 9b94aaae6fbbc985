pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod tools;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use orchestration::{Engine, EngineBuilder, EngineEvent};
pub use workflow::{ExecutionState, RunId, RunOutcome, RunPhase};
