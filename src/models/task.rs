//! Task model and status lifecycle helpers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Scheduling priority, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Nice to have.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Should run before ordinary work.
    High,
    /// Must run first.
    Critical,
}

/// Estimated effort, ordered from smallest to largest.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    /// One-line change.
    Trivial,
    /// Small, local change.
    Simple,
    /// Touches several files.
    #[default]
    Moderate,
    /// Cross-cutting change.
    Complex,
}

/// Lifecycle status for a task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to run.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cannot run until something external changes.
    Blocked,
}

impl TaskStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Re-asserting the current status is always allowed. `Running` may fall
    /// back to `Pending` only when an interrupted session is recovered.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Running | Self::Blocked | Self::Completed | Self::Failed
            ) | (
                Self::Running,
                Self::Completed | Self::Failed | Self::Blocked | Self::Pending
            ) | (Self::Blocked, Self::Pending | Self::Running | Self::Failed)
        )
    }

    /// Snake-case name used in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

/// A unit of agent work bound to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Globally unique, dot-delimited identifier (e.g. `3.2`). Immutable.
    pub id: String,
    /// Short human-readable title.
    pub title: String,
    /// Longer description handed to the workflow.
    #[serde(default)]
    pub description: String,
    /// Free-form category (`bugfix`, `refactor`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Estimated effort.
    #[serde(default)]
    pub complexity: TaskComplexity,
    /// Estimated time in minutes.
    #[serde(default)]
    pub estimated_minutes: u32,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Workflow name used for dispatch.
    pub workflow: String,
    /// Opaque payload for the workflow.
    #[serde(default)]
    pub workflow_input: serde_json::Value,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Paths the task is expected to touch, relative to the workspace root.
    #[serde(default)]
    pub files: Vec<String>,
    /// Creation timestamp.
    #[serde(default = "default_created_at")]
    pub created_at: DateTime<Utc>,
    /// Opaque key/value metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// Construct a pending task with defaults for everything but the essentials.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            kind: String::new(),
            priority: TaskPriority::default(),
            complexity: TaskComplexity::default(),
            estimated_minutes: 0,
            status: TaskStatus::Pending,
            workflow: workflow.into(),
            workflow_input: serde_json::Value::Null,
            dependencies: BTreeSet::new(),
            files: Vec::new(),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Id of the enclosing task for hierarchical ids (`3.2` → `3`).
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.id.rsplit_once('.').map(|(parent, _)| parent)
    }

    /// Whether this task sits anywhere below `ancestor` in the id hierarchy.
    #[must_use]
    pub fn is_subtask_of(&self, ancestor: &str) -> bool {
        self.id
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('.'))
    }

    /// Return a copy with `status` changed, enforcing the lifecycle rules.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateTransition` if the move is not permitted.
    pub fn with_status(&self, next: TaskStatus) -> Result<Self> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::StateTransition {
                entity: format!("task {}", self.id),
                from: self.status.as_str().to_owned(),
                to: next.as_str().to_owned(),
            });
        }
        Ok(Self {
            status: next,
            ..self.clone()
        })
    }
}

/// Partial task update applied by `AgentStateManager::update_task`.
///
/// The id is deliberately absent: task ids never change.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New priority.
    pub priority: Option<TaskPriority>,
    /// New status, validated against the lifecycle rules.
    pub status: Option<TaskStatus>,
    /// Replacement workflow payload.
    pub workflow_input: Option<serde_json::Value>,
    /// Replacement file list.
    pub files: Option<Vec<String>>,
    /// Metadata entries merged over the existing map.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskUpdate {
    /// Update that only changes the status.
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Produce the updated task without touching the original.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateTransition` if the status change is not permitted.
    pub fn apply(&self, task: &Task) -> Result<Task> {
        let mut next = match self.status {
            Some(status) => task.with_status(status)?,
            None => task.clone(),
        };
        if let Some(ref title) = self.title {
            next.title.clone_from(title);
        }
        if let Some(ref description) = self.description {
            next.description.clone_from(description);
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(ref input) = self.workflow_input {
            next.workflow_input = input.clone();
        }
        if let Some(ref files) = self.files {
            next.files.clone_from(files);
        }
        for (key, value) in &self.metadata {
            next.metadata.insert(key.clone(), value.clone());
        }
        Ok(next)
    }
}
