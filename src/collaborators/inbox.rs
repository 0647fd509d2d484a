//! Inbox-directory discovery source.
//!
//! Operators (or other tools) drop `*.json` files into the inbox directory.
//! Each file holds a single task object or an array of tasks. Files are
//! left in place, so a task is offered on every scan until the loop
//! acknowledges it. After that the in-process cache keeps it from being
//! handed to the loop twice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::{BoxFuture, Discovery, DiscoveryOptions};
use crate::models::task::Task;
use crate::{AppError, Result};

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum InboxFile {
    Many(Vec<Task>),
    One(Box<Task>),
}

/// Discovery that reads task files from a directory.
pub struct InboxDiscovery {
    inbox_dir: PathBuf,
    backoff: Backoff,
    reported: Mutex<HashSet<String>>,
}

impl InboxDiscovery {
    /// Watch `inbox_dir` with the given backoff schedule.
    #[must_use]
    pub fn new(inbox_dir: PathBuf, backoff: Backoff) -> Self {
        Self {
            inbox_dir,
            backoff,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Directory being scanned.
    #[must_use]
    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    /// Add ids that are already tracked elsewhere to the cache.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the cache mutex is poisoned.
    pub fn mark_reported<I>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let mut reported = self
            .reported
            .lock()
            .map_err(|_| AppError::Io("inbox cache mutex poisoned".into()))?;
        reported.extend(ids);
        Ok(())
    }

    fn scan(&self, options: DiscoveryOptions) -> Result<Vec<Task>> {
        let dir = glob::Pattern::escape(&self.inbox_dir.to_string_lossy());
        let pattern = Path::new(&dir).join("*.json");
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|err| AppError::Config(format!("invalid inbox pattern: {err}")))?;

        let mut paths: Vec<PathBuf> = entries.filter_map(std::result::Result::ok).collect();
        paths.sort();

        let mut found = Vec::new();
        for path in paths {
            match read_inbox_file(&path) {
                Ok(tasks) => found.extend(tasks),
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable task file"),
            }
        }

        let reported = self
            .reported
            .lock()
            .map_err(|_| AppError::Io("inbox cache mutex poisoned".into()))?;

        let mut fresh = Vec::new();
        let mut seen_this_scan = HashSet::new();
        for task in found {
            if !seen_this_scan.insert(task.id.clone()) {
                warn!(task_id = %task.id, "duplicate task id in inbox, keeping the first");
                continue;
            }
            if options.use_cache && reported.contains(&task.id) {
                continue;
            }
            fresh.push(task);
        }

        Ok(fresh)
    }
}

fn read_inbox_file(path: &Path) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: InboxFile = serde_json::from_str(&raw)
        .map_err(|err| AppError::Config(format!("invalid task file: {err}")))?;
    Ok(match parsed {
        InboxFile::Many(tasks) => tasks,
        InboxFile::One(task) => vec![*task],
    })
}

impl Discovery for InboxDiscovery {
    fn discover(&self, options: DiscoveryOptions) -> BoxFuture<'_, Result<Vec<Task>>> {
        Box::pin(async move {
            let tasks = self.scan(options)?;
            if tasks.is_empty() {
                debug!(inbox = %self.inbox_dir.display(), "inbox is empty");
            } else {
                info!(count = tasks.len(), "discovered inbox tasks");
            }
            Ok(tasks)
        })
    }

    fn backoff_seconds(&self) -> u64 {
        self.backoff.seconds()
    }

    fn increase_backoff(&self) {
        self.backoff.increase();
    }

    fn reset_backoff(&self) {
        self.backoff.reset();
    }

    fn acknowledge(&self, ids: &[String]) {
        if let Err(err) = self.mark_reported(ids.iter().cloned()) {
            warn!(%err, "failed to cache acknowledged task ids");
        }
    }
}
