//! Durable, crash-recoverable session state.
//!
//! The manager owns the only live copy of [`AgentState`]. Every mutation
//! builds a merged replacement, checks that no task was duplicated or
//! dropped, writes it to a temp file next to the live path and renames it
//! into place, and only then swaps the in-memory copy. A failed write
//! therefore leaves both the file and the in-memory state untouched.
//!
//! Checkpoints live in a `checkpoints/` directory beside the state file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::checkpoint_manager::{
    checkpoint_file_name, find_divergences, hash_files, referenced_files, scan_checkpoints,
    validate_checkpoint_name,
};
use crate::models::checkpoint::{Checkpoint, CheckpointSummary, RestoredCheckpoint};
use crate::models::session::parent_pid;
use crate::models::state::{
    AgentConfig, AgentMode, AgentState, ExecutionRecord, StateUpdate, TaskList, REQUIRED_FIELDS,
};
use crate::models::task::{Task, TaskStatus, TaskUpdate};
use crate::{AppError, Result};

const CHECKPOINT_DIR: &str = "checkpoints";

struct AutoSave {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns and persists the session's [`AgentState`].
pub struct AgentStateManager {
    state_path: PathBuf,
    checkpoint_dir: PathBuf,
    current: Mutex<Option<AgentState>>,
    auto_save: Mutex<Option<AutoSave>>,
}

impl AgentStateManager {
    /// Manager persisting to `state_path`.
    #[must_use]
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let checkpoint_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from(CHECKPOINT_DIR), |p| p.join(CHECKPOINT_DIR));
        Self {
            state_path,
            checkpoint_dir,
            current: Mutex::new(None),
            auto_save: Mutex::new(None),
        }
    }

    /// Live state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Directory holding checkpoint files.
    #[must_use]
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Create, persist, and return a fresh state for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the state cannot be written.
    pub fn initialize(&self, session_id: &str, config: AgentConfig) -> Result<AgentState> {
        let _span = info_span!("initialize_state", session_id).entered();
        let mut state =
            AgentState::new(session_id.to_owned(), config, std::process::id(), parent_pid());
        state.timestamps.last_save = Some(Utc::now());

        let mut current = self.lock_current()?;
        write_atomically(&self.state_path, &state)?;
        *current = Some(state.clone());
        info!(path = %self.state_path.display(), "state initialized");
        Ok(state)
    }

    /// Load the persisted state, if any, and make it live.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateCorruption` if the file cannot be parsed,
    /// lacks a required field, or tracks a task id twice.
    pub fn load_state(&self) -> Result<Option<AgentState>> {
        let _span = info_span!("load_state", path = %self.state_path.display()).entered();
        let raw = match fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no persisted state");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let state = parse_state(&self.state_path, &raw)?;
        info!(
            session_id = %state.session_id,
            tasks = state.task_count(),
            iteration = state.session.iteration,
            "state loaded"
        );
        *self.lock_current()? = Some(state.clone());
        Ok(Some(state))
    }

    /// Snapshot of the live state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the state mutex is poisoned.
    pub fn get_state(&self) -> Result<Option<AgentState>> {
        Ok(self.lock_current()?.clone())
    }

    /// Merge `update` into the live state and persist the result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization,
    /// `AppError::StateCorruption` if the merge would duplicate or drop a
    /// task id, or `AppError::Io` if persisting fails. On error the live
    /// state is unchanged.
    pub fn update_state(&self, update: StateUpdate) -> Result<AgentState> {
        self.replace(|base| Ok(update.merge(base)))
    }

    /// Rewrite the task `id` in whichever sequence holds it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no sequence holds the task or
    /// `AppError::StateTransition` if the status change is not permitted.
    pub fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<AgentState> {
        let _span = info_span!("update_task", task_id = id).entered();
        self.replace(|base| {
            let (list, task) = base
                .find_task(id)
                .ok_or_else(|| AppError::NotFound(format!("task {id} is not tracked")))?;
            let updated = update.apply(task)?;
            let mut next = base.clone();
            if let Some(slot) = next.tasks_mut(list).iter_mut().find(|t| t.id == id) {
                *slot = updated;
            }
            next.timestamps.last_activity = Utc::now();
            Ok(next)
        })
    }

    /// Move task `id` from `from` to the end of `to`, setting the matching
    /// status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `from` does not hold the task or
    /// `AppError::StateTransition` if its status cannot change to the one
    /// `to` implies. Nothing is mutated on error.
    pub fn move_task(&self, id: &str, from: TaskList, to: TaskList) -> Result<AgentState> {
        let _span = info_span!("move_task", task_id = id, from = from.as_str(), to = to.as_str())
            .entered();
        let next = self.replace(|base| {
            let Some(index) = base.tasks(from).iter().position(|t| t.id == id) else {
                return Err(AppError::NotFound(format!(
                    "task {id} is not in {}",
                    from.as_str()
                )));
            };
            let moved = base.tasks(from)[index].with_status(to.entry_status())?;
            let mut next = base.clone();
            next.tasks_mut(from).remove(index);
            next.tasks_mut(to).push(moved);
            next.timestamps.last_activity = Utc::now();
            Ok(next)
        })?;
        debug!("task moved");
        Ok(next)
    }

    /// Append every task not already tracked in any sequence to the queue
    /// as [`TaskStatus::Pending`], whatever status it arrived with.
    ///
    /// Returns the ids that were added.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if persisting fails.
    pub fn enqueue_tasks(&self, tasks: &[Task]) -> Result<Vec<String>> {
        let mut added = Vec::new();
        self.replace(|base| {
            let mut tracked = base.tracked_ids();
            let mut next = base.clone();
            for task in tasks {
                if tracked.insert(task.id.clone()) {
                    if task.status != TaskStatus::Pending {
                        debug!(task_id = %task.id, status = task.status.as_str(), "incoming task reset to pending");
                    }
                    added.push(task.id.clone());
                    next.task_queue.push(Task {
                        status: TaskStatus::Pending,
                        ..task.clone()
                    });
                }
            }
            next.timestamps.last_activity = Utc::now();
            Ok(next)
        })?;
        if !added.is_empty() {
            info!(added = added.len(), "tasks enqueued");
        }
        Ok(added)
    }

    /// Append an execution outcome to the history and fold it into the
    /// metrics.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if persisting fails.
    pub fn record_execution(&self, record: ExecutionRecord) -> Result<AgentState> {
        self.replace(move |base| {
            let mut next = base.clone();
            if record.success {
                next.metrics.tasks_completed += 1;
            } else {
                next.metrics.tasks_failed += 1;
            }
            next.metrics.total_execution_ms = next
                .metrics
                .total_execution_ms
                .saturating_add(record.duration_ms);
            next.metrics.files_modified = next
                .metrics
                .files_modified
                .saturating_add(record.files_modified.len() as u64);
            next.refresh_success_rate();
            next.execution_history.push(record);
            next.timestamps.last_activity = Utc::now();
            Ok(next)
        })
    }

    /// Switch the recorded loop mode, logging the transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if persisting fails.
    pub fn record_mode_transition(&self, mode: AgentMode) -> Result<AgentState> {
        self.update_state(StateUpdate {
            current_mode: Some(mode),
            ..StateUpdate::default()
        })
    }

    /// Count one more loop iteration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if persisting fails.
    pub fn record_iteration(&self) -> Result<AgentState> {
        self.replace(|base| {
            let mut next = base.clone();
            next.session.iteration += 1;
            next.timestamps.last_activity = Utc::now();
            Ok(next)
        })
    }

    /// Raise the recorded peak memory if `memory_mb` exceeds it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if persisting fails.
    pub fn record_peak_memory(&self, memory_mb: u64) -> Result<AgentState> {
        {
            let current = self.lock_current()?;
            if let Some(state) = current.as_ref() {
                if state.metrics.peak_memory_mb >= memory_mb {
                    return Ok(state.clone());
                }
            }
        }
        self.replace(|base| {
            let mut next = base.clone();
            next.metrics.peak_memory_mb = next.metrics.peak_memory_mb.max(memory_mb);
            Ok(next)
        })
    }

    /// Return queued tasks left `running` by a crashed process to `pending`.
    ///
    /// Returns the ids that were reset.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if persisting fails.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .lock_current()?
            .as_ref()
            .ok_or_else(not_initialized)?
            .task_queue
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        self.replace(|base| {
            let mut next = base.clone();
            for task in &mut next.task_queue {
                if task.status == TaskStatus::Running {
                    *task = task.with_status(TaskStatus::Pending)?;
                }
            }
            Ok(next)
        })?;
        warn!(tasks = ?stale, "reset interrupted tasks to pending");
        Ok(stale)
    }

    /// Persist the live state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` before initialization or `AppError::Io`
    /// if the write fails.
    pub fn save_state(&self) -> Result<()> {
        let mut current = self.lock_current()?;
        let state = current.as_mut().ok_or_else(not_initialized)?;
        let previous = state.timestamps.last_save;
        state.timestamps.last_save = Some(Utc::now());
        if let Err(err) = write_atomically(&self.state_path, &*state) {
            state.timestamps.last_save = previous;
            return Err(err);
        }
        debug!(path = %self.state_path.display(), "state saved");
        Ok(())
    }

    /// Delete the live file and forget the in-memory state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be removed.
    pub fn clear_state(&self) -> Result<()> {
        let _span = info_span!("clear_state", path = %self.state_path.display()).entered();
        let mut current = self.lock_current()?;
        match fs::remove_file(&self.state_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        *current = None;
        info!("state cleared");
        Ok(())
    }

    /// Write an immutable snapshot of the live state as checkpoint `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid name, `AppError::NotFound`
    /// before initialization, or `AppError::Io` if the write fails.
    pub fn checkpoint(&self, name: &str) -> Result<CheckpointSummary> {
        let _span = info_span!("checkpoint", name).entered();
        validate_checkpoint_name(name)?;

        let state = self.lock_current()?.clone().ok_or_else(not_initialized)?;
        let files = referenced_files(&state);
        let file_hashes = hash_files(&state.config.workspace_root, &files);
        let created_at = Utc::now();
        let checkpoint = Checkpoint {
            name: name.to_owned(),
            created_at,
            state,
            file_hashes,
        };

        fs::create_dir_all(&self.checkpoint_dir)?;
        let mut epoch_ms = u64::try_from(created_at.timestamp_millis()).unwrap_or_default();
        let mut path = self.checkpoint_dir.join(checkpoint_file_name(name, epoch_ms));
        while path.exists() {
            epoch_ms += 1;
            path = self.checkpoint_dir.join(checkpoint_file_name(name, epoch_ms));
        }
        write_atomically(&path, &checkpoint)?;

        info!(
            path = %path.display(),
            files_hashed = checkpoint.file_hashes.len(),
            "checkpoint created"
        );
        Ok(CheckpointSummary {
            name: name.to_owned(),
            created_epoch_ms: epoch_ms,
            path,
        })
    }

    /// Every checkpoint on disk, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the directory path cannot be globbed.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        scan_checkpoints(&self.checkpoint_dir)
    }

    /// Replace the live state with the newest checkpoint called `name` and
    /// persist it immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no checkpoint has that name,
    /// `AppError::StateCorruption` if the checkpoint cannot be parsed, or
    /// `AppError::Io` if the live state cannot be written.
    pub fn restore_checkpoint(&self, name: &str) -> Result<RestoredCheckpoint> {
        let _span = info_span!("restore_checkpoint", name).entered();
        let summary = scan_checkpoints(&self.checkpoint_dir)?
            .into_iter()
            .filter(|c| c.name == name)
            .max_by_key(|c| c.created_epoch_ms)
            .ok_or_else(|| AppError::NotFound(format!("no checkpoint named {name}")))?;

        let raw = fs::read_to_string(&summary.path)?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&raw).map_err(|err| AppError::StateCorruption {
                path: summary.path.clone(),
                reason: format!("unreadable checkpoint: {err}"),
            })?;

        let mut files = referenced_files(&checkpoint.state);
        files.extend(checkpoint.file_hashes.keys().cloned());
        let current_hashes = hash_files(&checkpoint.state.config.workspace_root, &files);
        let divergences = find_divergences(&checkpoint.file_hashes, &current_hashes);

        let mut state = checkpoint.state;
        state.timestamps.last_save = Some(Utc::now());
        {
            let mut current = self.lock_current()?;
            write_atomically(&self.state_path, &state)?;
            *current = Some(state.clone());
        }

        if divergences.is_empty() {
            info!(path = %summary.path.display(), "checkpoint restored");
        } else {
            warn!(
                path = %summary.path.display(),
                diverged_count = divergences.len(),
                "checkpoint restored with file divergences"
            );
        }

        Ok(RestoredCheckpoint {
            state,
            path: summary.path,
            divergences,
        })
    }

    /// Persist the live state every `interval` until stopped. A no-op if
    /// autosave is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_auto_save(self: &Arc<Self>, interval: Duration) {
        let Ok(mut slot) = self.auto_save.lock() else {
            warn!("autosave mutex poisoned");
            return;
        };
        if slot.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        () = task_cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(manager) = manager.upgrade() else { break };
                            match manager.save_state() {
                                Ok(()) | Err(AppError::NotFound(_)) => {}
                                Err(err) => warn!(%err, "autosave failed"),
                            }
                        }
                    }
                }
                debug!("autosave stopped");
            }
            .instrument(info_span!("auto_save")),
        );

        info!(interval_secs = interval.as_secs(), "autosave started");
        *slot = Some(AutoSave { cancel, handle });
    }

    /// Stop the autosave task. A no-op if it is not running.
    pub fn stop_auto_save(&self) {
        let taken = match self.auto_save.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(auto_save) = taken {
            auto_save.cancel.cancel();
        }
    }

    fn lock_current(&self) -> Result<MutexGuard<'_, Option<AgentState>>> {
        self.current
            .lock()
            .map_err(|_| AppError::Io("state mutex poisoned".into()))
    }

    /// Build a replacement from the live state, validate it, persist it,
    /// then make it live.
    fn replace<F>(&self, build: F) -> Result<AgentState>
    where
        F: FnOnce(&AgentState) -> Result<AgentState>,
    {
        let mut current = self.lock_current()?;
        let base = current.as_ref().ok_or_else(not_initialized)?;
        let mut next = build(base)?;
        check_task_sets(&self.state_path, base, &next)?;
        next.timestamps.last_save = Some(Utc::now());
        write_atomically(&self.state_path, &next)?;
        *current = Some(next.clone());
        Ok(next)
    }
}

impl Drop for AgentStateManager {
    fn drop(&mut self) {
        self.stop_auto_save();
    }
}

fn not_initialized() -> AppError {
    AppError::NotFound("agent state has not been initialized".into())
}

/// Reject replacements that would track an id twice or lose one.
fn check_task_sets(path: &Path, base: &AgentState, next: &AgentState) -> Result<()> {
    if let Some(id) = next.duplicate_task_id() {
        return Err(AppError::StateCorruption {
            path: path.to_owned(),
            reason: format!("update would track task {id} in more than one sequence"),
        });
    }
    let kept = next.tracked_ids();
    let mut dropped: Vec<String> = base
        .tracked_ids()
        .into_iter()
        .filter(|id| !kept.contains(id))
        .collect();
    dropped.sort();
    if let Some(id) = dropped.first() {
        return Err(AppError::StateCorruption {
            path: path.to_owned(),
            reason: format!("update would drop tracked task {id}"),
        });
    }
    Ok(())
}

/// Parse and validate a persisted state record.
///
/// # Errors
///
/// Returns `AppError::StateCorruption` describing the first problem found.
pub fn parse_state(path: &Path, raw: &str) -> Result<AgentState> {
    let corrupt = |reason: String| AppError::StateCorruption {
        path: path.to_owned(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|err| corrupt(format!("invalid json: {err}")))?;
    let Some(fields) = value.as_object() else {
        return Err(corrupt("state is not a json object".into()));
    };
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !fields.contains_key(**f)) {
        return Err(corrupt(format!("missing required field {missing}")));
    }

    let state: AgentState =
        serde_json::from_value(value).map_err(|err| corrupt(format!("invalid state: {err}")))?;
    if let Some(id) = state.duplicate_task_id() {
        return Err(corrupt(format!("task {id} appears in more than one sequence")));
    }
    Ok(state)
}

/// Write `value` as pretty JSON to a temp file beside `path`, then rename
/// it over `path`.
fn write_atomically<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let json = serde_json::to_vec_pretty(value)
        .map_err(|err| AppError::Io(format!("failed to serialize {}: {err}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| {
        AppError::Io(format!("failed to replace {}: {}", path.display(), err.error))
    })?;
    Ok(())
}
