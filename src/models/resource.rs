//! Resource usage samples and limit-breach notifications.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Which limit was breached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Resident memory.
    Memory,
    /// Session wall-clock time.
    SessionTime,
    /// Files modified across the session.
    FilesModified,
}

impl Display for LimitKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::SessionTime => "session_time",
            Self::FilesModified => "files_modified",
        })
    }
}

/// Notification delivered to the resource-limit callback.
///
/// `current` and `max` are megabytes for memory, minutes for session time
/// and a plain count for files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct LimitExceeded {
    /// Breached limit.
    pub limit: LimitKind,
    /// Observed value.
    pub current: f64,
    /// Configured maximum.
    pub max: f64,
    /// Human-readable summary.
    pub message: String,
}

impl LimitExceeded {
    /// Build a notification with a standard message.
    #[must_use]
    pub fn new(limit: LimitKind, current: f64, max: f64) -> Self {
        let unit = match limit {
            LimitKind::Memory => " MB",
            LimitKind::SessionTime => " min",
            LimitKind::FilesModified => "",
        };
        Self {
            limit,
            current,
            max,
            message: format!("{limit} limit exceeded: {current:.1}{unit} of {max:.1}{unit}"),
        }
    }
}

impl From<&LimitExceeded> for crate::AppError {
    fn from(breach: &LimitExceeded) -> Self {
        Self::ResourceLimit {
            limit: breach.limit.to_string(),
            current: breach.current,
            max: breach.max,
        }
    }
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceUsage {
    /// Last sampled resident memory.
    pub current_memory_mb: u64,
    /// Highest sampled resident memory.
    pub peak_memory_mb: u64,
    /// Time since the session started.
    pub elapsed_ms: u64,
    /// Whether every configured limit was respected at the last sample.
    pub within_limits: bool,
}
