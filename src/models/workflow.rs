//! Canonical workflow result and invocation context.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Normalized result of any workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowExecutionResult {
    /// Whether the workflow reported success.
    pub success: bool,
    /// Structured workflow-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Human-readable output or summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Paths the workflow modified.
    #[serde(default)]
    pub files_modified: Vec<String>,
}

impl WorkflowExecutionResult {
    /// Successful result with no payload.
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Failed result carrying `error`.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Ambient information handed to every workflow invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowContext {
    /// Session the invocation belongs to.
    pub session_id: String,
    /// Task being executed.
    pub task_id: String,
    /// Task title, for prompts and logs.
    pub task_title: String,
    /// Task description, for prompts.
    pub task_description: String,
    /// Workspace the workflow operates on.
    pub workspace_root: PathBuf,
    /// Loop iteration that scheduled the task.
    pub iteration: u64,
}
