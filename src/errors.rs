//! Error types shared across the application.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Every variant carries enough context (ids, limits, paths) to print a
/// one-paragraph diagnosis without correlating logs.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A lifecycle transition was rejected.
    StateTransition {
        /// Entity whose state was being changed (e.g. `task 3.2`, `loop`).
        entity: String,
        /// State the entity was in.
        from: String,
        /// State that was requested.
        to: String,
    },
    /// A task did not complete successfully inside the executor.
    TaskExecution {
        /// Task that failed.
        task_id: String,
        /// Originating cause.
        cause: String,
    },
    /// An external workflow raised an error while running.
    WorkflowInvocation {
        /// Workflow name from the dispatch table.
        workflow: String,
        /// Originating cause.
        cause: String,
    },
    /// No workflow is registered under the requested name.
    UnknownWorkflow(String),
    /// Work was cancelled before or while it ran.
    Cancelled(String),
    /// Persisted state is malformed or incomplete.
    StateCorruption {
        /// File that failed validation.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// A configured resource limit was exceeded.
    ResourceLimit {
        /// Limit name (`memory`, `session_time`, `files_modified`).
        limit: String,
        /// Observed value.
        current: f64,
        /// Configured maximum.
        max: f64,
    },
    /// Another live process already holds the session lock.
    SessionConflict {
        /// Contended session.
        session_id: String,
        /// Process id of the holder.
        pid: u32,
        /// Host of the holder.
        hostname: String,
    },
    /// An operation was refused by the safety policy.
    SafetyViolation {
        /// Workflow that was refused.
        workflow: String,
        /// Policy reason.
        reason: String,
    },
    /// A plan failed structural validation.
    InvalidPlan(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::StateTransition { entity, from, to } => {
                write!(f, "state transition: {entity} cannot move from {from} to {to}")
            }
            Self::TaskExecution { task_id, cause } => {
                write!(f, "task execution: task {task_id} failed: {cause}")
            }
            Self::WorkflowInvocation { workflow, cause } => {
                write!(f, "workflow invocation: {workflow} failed: {cause}")
            }
            Self::UnknownWorkflow(name) => write!(f, "unknown workflow: {name}"),
            Self::Cancelled(what) => write!(f, "cancelled: {what}"),
            Self::StateCorruption { path, reason } => {
                write!(f, "state corruption: {}: {reason}", path.display())
            }
            Self::ResourceLimit {
                limit,
                current,
                max,
            } => write!(
                f,
                "resource limit: {limit} exceeded ({current:.1} of {max:.1})"
            ),
            Self::SessionConflict {
                session_id,
                pid,
                hostname,
            } => write!(
                f,
                "session conflict: {session_id} is held by pid {pid} on {hostname}"
            ),
            Self::SafetyViolation { workflow, reason } => {
                write!(f, "safety violation: {workflow} refused: {reason}")
            }
            Self::InvalidPlan(msg) => write!(f, "invalid plan: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
