//! Checkpoint file naming and workspace divergence detection.
//!
//! Checkpoints are stored as `checkpoint-<name>-<epoch_ms>.json`. Alongside
//! the state snapshot each checkpoint records SHA-256 hashes of the files
//! its tasks reference, so a later restore can report which of those files
//! changed in the meantime.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::checkpoint::{CheckpointSummary, DivergenceEntry, DivergenceKind};
use crate::models::state::{AgentState, TaskList};
use crate::{AppError, Result};

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".json";

/// Reject checkpoint names that would be ambiguous or escape the directory.
///
/// # Errors
///
/// Returns `AppError::Config` unless the name matches `[A-Za-z0-9_.-]+`
/// and does not end in `-<digits>`.
pub fn validate_checkpoint_name(name: &str) -> Result<()> {
    let allowed = Regex::new(r"^[A-Za-z0-9_.-]+$")
        .map_err(|err| AppError::Config(format!("checkpoint name pattern: {err}")))?;
    let trailing_stamp = Regex::new(r"-\d+$")
        .map_err(|err| AppError::Config(format!("checkpoint name pattern: {err}")))?;
    if !allowed.is_match(name) || name.starts_with('.') || trailing_stamp.is_match(name) {
        return Err(AppError::Config(format!(
            "invalid checkpoint name {name:?}: use letters, digits, '.', '_' or '-' \
             and do not end with -<digits>"
        )));
    }
    Ok(())
}

/// File name for checkpoint `name` taken at `epoch_ms`.
#[must_use]
pub fn checkpoint_file_name(name: &str, epoch_ms: u64) -> String {
    format!("{PREFIX}{name}-{epoch_ms}{SUFFIX}")
}

/// Split a checkpoint file path back into its summary, if it is one.
#[must_use]
pub fn parse_checkpoint_path(path: &Path) -> Option<CheckpointSummary> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (name, stamp) = stem.rsplit_once('-')?;
    if name.is_empty() {
        return None;
    }
    Some(CheckpointSummary {
        name: name.to_owned(),
        created_epoch_ms: stamp.parse().ok()?,
        path: path.to_owned(),
    })
}

/// Every checkpoint in `dir`, oldest first.
///
/// # Errors
///
/// Returns `AppError::Config` if the glob pattern cannot be built.
pub fn scan_checkpoints(dir: &Path) -> Result<Vec<CheckpointSummary>> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = Path::new(&escaped).join(format!("{PREFIX}*{SUFFIX}"));
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|err| AppError::Config(format!("invalid checkpoint pattern: {err}")))?;

    let mut found: Vec<CheckpointSummary> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|path| parse_checkpoint_path(&path))
        .collect();
    found.sort_by(|a, b| {
        a.created_epoch_ms
            .cmp(&b.created_epoch_ms)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(found)
}

/// Files referenced by any task in `state`, relative to the workspace.
#[must_use]
pub fn referenced_files(state: &AgentState) -> BTreeSet<String> {
    TaskList::ALL
        .into_iter()
        .flat_map(|list| state.tasks(list).iter())
        .flat_map(|task| task.files.iter().cloned())
        .collect()
}

/// SHA-256 of each listed file that currently exists under `root`.
///
/// Files that are missing or unreadable are left out of the map.
#[must_use]
pub fn hash_files<'a, I>(root: &Path, files: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut hashes = BTreeMap::new();
    for rel in files {
        let path = resolve(root, rel);
        match std::fs::read(&path) {
            Ok(content) => {
                hashes.insert(rel.clone(), sha256_hex(&content));
            }
            Err(err) => debug!(file = %path.display(), %err, "skipping unhashable file"),
        }
    }
    hashes
}

fn resolve(root: &Path, rel: &str) -> PathBuf {
    let candidate = Path::new(rel);
    if candidate.is_absolute() {
        candidate.to_owned()
    } else {
        root.join(candidate)
    }
}

/// Compare hashes taken at checkpoint time against current ones.
#[must_use]
pub fn find_divergences(
    checkpoint_hashes: &BTreeMap<String, String>,
    current_hashes: &BTreeMap<String, String>,
) -> Vec<DivergenceEntry> {
    let mut diverged = Vec::new();

    for (file, old_hash) in checkpoint_hashes {
        let kind = match current_hashes.get(file) {
            Some(new_hash) if new_hash != old_hash => DivergenceKind::Modified,
            None => DivergenceKind::Deleted,
            Some(_) => continue,
        };
        diverged.push(DivergenceEntry {
            file_path: file.clone(),
            kind,
        });
    }

    diverged.extend(
        current_hashes
            .keys()
            .filter(|file| !checkpoint_hashes.contains_key(*file))
            .map(|file| DivergenceEntry {
                file_path: file.clone(),
                kind: DivergenceKind::Added,
            }),
    );

    diverged.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    diverged
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
