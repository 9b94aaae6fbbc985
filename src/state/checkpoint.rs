//! Durable run snapshots for crash resume.
//!
//! A checkpoint is keyed by run id and iteration. Saving twice within one
//! iteration replaces the earlier snapshot, so the newest file for the
//! highest iteration is always the latest state of the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::core::{Fingerprint, TaskId};
use crate::error::{Error, Result};
use crate::workflow::{ExecutionState, RunId, RunPhase};

/// Immutable snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub iteration: u32,
    pub phase: RunPhase,
    pub saved_at: DateTime<Utc>,
    /// Cache keys referenced by the graph. Cache contents are not stored.
    pub fingerprints: BTreeMap<TaskId, Fingerprint>,
    pub state: ExecutionState,
}

impl Checkpoint {
    pub fn capture(run_id: RunId, iteration: u32, state: &ExecutionState) -> Self {
        Self {
            run_id,
            iteration,
            phase: state.phase(),
            saved_at: Utc::now(),
            fingerprints: state.graph.fingerprints(),
            state: state.clone(),
        }
    }

    /// The stored state, with interrupted tasks returned to pending.
    pub fn into_state(self) -> ExecutionState {
        let mut state = self.state;
        let reset = state.reset_interrupted();
        if !reset.is_empty() {
            tracing::info!(
                run_id = %self.run_id,
                count = reset.len(),
                "reset interrupted tasks to pending"
            );
        }
        state
    }
}

pub trait CheckpointStore: Send + Sync {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// The checkpoint with the highest iteration for `run_id`.
    fn latest(&self, run_id: RunId) -> Result<Checkpoint>;

    /// Runs with at least one checkpoint, oldest first.
    fn list_runs(&self) -> Result<Vec<RunId>>;

    fn save(&self, run_id: RunId, iteration: u32, state: &ExecutionState) -> Result<()> {
        self.save_checkpoint(&Checkpoint::capture(run_id, iteration, state))
    }

    /// Latest state of `run_id`. No task in the result is running.
    fn load(&self, run_id: RunId) -> Result<ExecutionState> {
        Ok(self.latest(run_id)?.into_state())
    }
}

/// Checkpoints as JSON files under `<root>/<run-id>/iteration-NNNNNN.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn checkpoint_path(&self, run_id: RunId, iteration: u32) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("iteration-{:06}.json", iteration))
    }

    /// Iterations with a checkpoint for `run_id`, ascending.
    pub fn iterations(&self, run_id: RunId) -> Result<Vec<u32>> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut iterations: Vec<u32> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_iteration(&entry.file_name().to_string_lossy()))
            .collect();
        iterations.sort_unstable();
        Ok(iterations)
    }
}

fn parse_iteration(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("iteration-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl CheckpointStore for FileCheckpointStore {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path(checkpoint.run_id, checkpoint.iteration);
        let json = serde_json::to_vec_pretty(checkpoint)?;
        atomic_write(&path, &json)?;
        tracing::debug!(
            run_id = %checkpoint.run_id,
            iteration = checkpoint.iteration,
            phase = %checkpoint.phase,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    fn latest(&self, run_id: RunId) -> Result<Checkpoint> {
        let iteration = self
            .iterations(run_id)?
            .pop()
            .ok_or(Error::CheckpointNotFound(run_id))?;
        let path = self.checkpoint_path(run_id, iteration);
        let checkpoint: Checkpoint = serde_json::from_slice(&fs::read(&path)?)?;
        tracing::debug!(run_id = %run_id, iteration, "checkpoint loaded");
        Ok(checkpoint)
    }

    fn list_runs(&self) -> Result<Vec<RunId>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<RunId> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();
        runs.sort();
        Ok(runs)
    }
}

/// Write to a sibling temp file, sync, then rename over the target.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    write().map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        Error::Io(err)
    })
}

/// In-process store, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<BTreeMap<RunId, BTreeMap<u32, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct `(run, iteration)` snapshots held.
    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RunId, BTreeMap<u32, Checkpoint>>> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut runs = self.lock();
        runs.entry(checkpoint.run_id)
            .or_default()
            .insert(checkpoint.iteration, checkpoint.clone());
        Ok(())
    }

    fn latest(&self, run_id: RunId) -> Result<Checkpoint> {
        let runs = self.lock();
        runs.get(&run_id)
            .and_then(|iterations| iterations.values().next_back())
            .cloned()
            .ok_or(Error::CheckpointNotFound(run_id))
    }

    fn list_runs(&self) -> Result<Vec<RunId>> {
        let runs = self.lock();
        Ok(runs.keys().copied().collect())
    }
}
