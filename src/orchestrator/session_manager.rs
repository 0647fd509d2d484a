//! Cross-process session exclusivity.
//!
//! Each session id maps to one lock record holding the owner's process
//! identity. In file mode the record is `<lock_dir>/<session_id>.lock`:
//!
//! - a first acquire writes the record to a temp file and links it into
//!   place with no-clobber semantics, so a lock file is never observed
//!   half-written and two racing processes get exactly one winner;
//! - an acquire that finds a record whose owner is dead reclaims it by
//!   renaming a fresh record over it, then reads it back to confirm that
//!   this process won any concurrent reclaim.
//!
//! In memory mode (single-process tests) a process-local table stands in
//! for the directory.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{info, info_span, warn};

use crate::models::session::SessionInfo;
use crate::{AppError, Result};

/// Lock file extension.
const LOCK_EXTENSION: &str = "lock";

/// Result of [`SessionManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This process now owns the session.
    Acquired(SessionInfo),
    /// Another live process owns the session.
    Held {
        /// Human-readable explanation.
        reason: String,
        /// The current holder.
        existing: SessionInfo,
    },
}

impl AcquireOutcome {
    /// Whether the lock was obtained.
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// Convert into the owned session info or a `SessionConflict` error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionConflict` naming the holder when not acquired.
    pub fn into_result(self) -> Result<SessionInfo> {
        match self {
            Self::Acquired(info) => Ok(info),
            Self::Held { existing, .. } => Err(AppError::SessionConflict {
                session_id: existing.session_id,
                pid: existing.pid,
                hostname: existing.hostname,
            }),
        }
    }
}

enum Backend {
    File { lock_dir: PathBuf },
    Memory(Mutex<HashMap<String, SessionInfo>>),
}

/// Grants one live process exclusive use of a session id.
pub struct SessionManager {
    backend: Backend,
}

impl SessionManager {
    /// Manager storing lock files in `lock_dir`.
    #[must_use]
    pub fn file_backed(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::File {
                lock_dir: lock_dir.into(),
            },
        }
    }

    /// Manager backed by a process-local table.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
        }
    }

    /// Try to take exclusive ownership of `session_id`.
    ///
    /// A lock held by a dead process is reclaimed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid session id,
    /// `AppError::StateCorruption` if the existing lock record cannot be
    /// parsed, or `AppError::Io` on file-system failure.
    pub fn acquire(&self, session_id: &str) -> Result<AcquireOutcome> {
        let _span = info_span!("acquire_session", session_id).entered();
        validate_session_id(session_id)?;

        let outcome = match &self.backend {
            Backend::File { lock_dir } => acquire_file(lock_dir, session_id)?,
            Backend::Memory(table) => {
                let mut table = lock_table(table)?;
                match table.get(session_id) {
                    Some(existing) if existing.is_owner_alive() => held(existing.clone()),
                    _ => {
                        let info = SessionInfo::capture(session_id);
                        table.insert(session_id.to_owned(), info.clone());
                        AcquireOutcome::Acquired(info)
                    }
                }
            }
        };

        match &outcome {
            AcquireOutcome::Acquired(info) => info!(pid = info.pid, "session lock acquired"),
            AcquireOutcome::Held { existing, .. } => warn!(
                holder_pid = existing.pid,
                holder_host = %existing.hostname,
                "session lock is held by another process"
            ),
        }

        Ok(outcome)
    }

    /// Remove the lock for `session_id`. Releasing an absent lock is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid session id or
    /// `AppError::Io` if the lock file exists but cannot be removed.
    pub fn release(&self, session_id: &str) -> Result<()> {
        let _span = info_span!("release_session", session_id).entered();
        validate_session_id(session_id)?;

        match &self.backend {
            Backend::File { lock_dir } => match fs::remove_file(lock_path(lock_dir, session_id)) {
                Ok(()) => info!("session lock released"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "failed to remove lock for {session_id}: {err}"
                    )))
                }
            },
            Backend::Memory(table) => {
                if lock_table(table)?.remove(session_id).is_some() {
                    info!("session lock released");
                }
            }
        }

        Ok(())
    }

    /// Look up the lock record for `session_id`, live or stale.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateCorruption` if the record cannot be parsed.
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        validate_session_id(session_id)?;
        match &self.backend {
            Backend::File { lock_dir } => read_lock(&lock_path(lock_dir, session_id)),
            Backend::Memory(table) => Ok(lock_table(table)?.get(session_id).cloned()),
        }
    }

    /// Whether `session_id` is held by a live process.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`get_session`](Self::get_session).
    pub fn is_active(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .get_session(session_id)?
            .is_some_and(|info| info.is_owner_alive()))
    }

    /// Every session currently held by a live process, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the lock directory cannot be read or
    /// `AppError::StateCorruption` if a lock file cannot be parsed.
    pub fn list_active(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = match &self.backend {
            Backend::File { lock_dir } => {
                let entries = match fs::read_dir(lock_dir) {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(err) => return Err(err.into()),
                };
                let mut found = Vec::new();
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                        continue;
                    }
                    if let Some(info) = read_lock(&path)? {
                        found.push(info);
                    }
                }
                found
            }
            Backend::Memory(table) => lock_table(table)?.values().cloned().collect(),
        };

        sessions.retain(SessionInfo::is_owner_alive);
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }
}

/// Reject ids that could escape the lock directory.
///
/// # Errors
///
/// Returns `AppError::Config` if the id is empty, `.`/`..`, or contains
/// characters outside `[A-Za-z0-9._-]`.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let pattern = Regex::new(r"^[A-Za-z0-9._-]+$")
        .map_err(|err| AppError::Config(format!("session id pattern: {err}")))?;
    if !pattern.is_match(session_id) || session_id == "." || session_id == ".." {
        return Err(AppError::Config(format!(
            "invalid session id {session_id:?}: use letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}

fn lock_path(lock_dir: &Path, session_id: &str) -> PathBuf {
    lock_dir.join(format!("{session_id}.{LOCK_EXTENSION}"))
}

fn lock_table(
    table: &Mutex<HashMap<String, SessionInfo>>,
) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionInfo>>> {
    table
        .lock()
        .map_err(|_| AppError::Io("session table mutex poisoned".into()))
}

fn held(existing: SessionInfo) -> AcquireOutcome {
    AcquireOutcome::Held {
        reason: format!(
            "session {} is held by pid {} (user {}) on {} since {}",
            existing.session_id,
            existing.pid,
            existing.username,
            existing.hostname,
            existing.start_time.to_rfc3339()
        ),
        existing,
    }
}

fn read_lock(path: &Path) -> Result<Option<SessionInfo>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| AppError::StateCorruption {
            path: path.to_owned(),
            reason: format!("unreadable session lock: {err}"),
        })
}

fn write_record(lock_dir: &Path, info: &SessionInfo) -> Result<NamedTempFile> {
    let json = serde_json::to_vec_pretty(info)
        .map_err(|err| AppError::Io(format!("failed to serialize session lock: {err}")))?;
    let mut tmp = NamedTempFile::new_in(lock_dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

fn acquire_file(lock_dir: &Path, session_id: &str) -> Result<AcquireOutcome> {
    fs::create_dir_all(lock_dir)?;
    let path = lock_path(lock_dir, session_id);
    let info = SessionInfo::capture(session_id);

    // Two attempts: the holder may release between our failed link and the read.
    for _ in 0..2 {
        let tmp = write_record(lock_dir, &info)?;
        let tmp = match tmp.persist_noclobber(&path) {
            Ok(_) => return Ok(AcquireOutcome::Acquired(info)),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => err.file,
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to create lock {}: {}",
                    path.display(),
                    err.error
                )))
            }
        };

        let Some(existing) = read_lock(&path)? else {
            continue;
        };

        if existing.is_owner_alive() {
            return Ok(held(existing));
        }

        warn!(
            stale_pid = existing.pid,
            "reclaiming session lock from dead process"
        );
        tmp.persist(&path).map_err(|err| {
            AppError::Io(format!(
                "failed to reclaim lock {}: {}",
                path.display(),
                err.error
            ))
        })?;

        return match read_lock(&path)? {
            Some(current) if current == info => Ok(AcquireOutcome::Acquired(info)),
            Some(current) => Ok(held(current)),
            None => Err(AppError::Io(format!(
                "lock {} vanished during reclaim",
                path.display()
            ))),
        };
    }

    Err(AppError::Io(format!(
        "could not acquire lock {} after retry",
        path.display()
    )))
}
