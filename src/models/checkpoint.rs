//! Checkpoint model for agent state snapshots.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::AgentState;

/// A named, immutable snapshot of agent state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Human-readable label (e.g. `before-refactor`).
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Full state at checkpoint time.
    pub state: AgentState,
    /// Map of task-referenced file path to SHA-256 hash.
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

/// Directory listing entry for a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Checkpoint name.
    pub name: String,
    /// Milliseconds since the Unix epoch, taken from the file name.
    pub created_epoch_ms: u64,
    /// Checkpoint file.
    pub path: PathBuf,
}

/// A file that has diverged between checkpoint and current workspace state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceEntry {
    /// Relative file path.
    pub file_path: String,
    /// Kind of divergence.
    pub kind: DivergenceKind,
}

/// The type of file divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    /// File content has changed.
    Modified,
    /// File existed at checkpoint time but is now missing.
    Deleted,
    /// File exists now but did not when the checkpoint was taken.
    Added,
}

/// Result of restoring a checkpoint.
#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    /// State that is now live.
    pub state: AgentState,
    /// Checkpoint file that was restored.
    pub path: PathBuf,
    /// Files that changed since the checkpoint was taken.
    pub divergences: Vec<DivergenceEntry>,
}
