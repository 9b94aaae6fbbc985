//! Run persistence and memoization.
//!
//! This module holds the execution history value, the fingerprint-keyed
//! result cache and the checkpoint stores used for crash resume.

mod cache;
mod checkpoint;
mod history;

pub use cache::ResultCache;
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use history::{ExecutionHistory, InvocationOutcome, InvocationRecord, IterationRecord};
