//! Workflow dispatch table and result normalization.
//!
//! Workflows are registered by name at startup. Each registration carries a
//! [`WorkflowKind`] that knows how to fold that workflow's JSON output into
//! a [`WorkflowExecutionResult`]; names outside the known set use the
//! generic normalizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::collaborators::Workflow;
use crate::models::workflow::{WorkflowContext, WorkflowExecutionResult};
use crate::policy::{AllowAll, SafetyCheck};
use crate::{AppError, Result};

/// Output shape a registered workflow is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    /// Implements a change; reports `files_modified` or `changes[].path`.
    Code,
    /// Repairs a defect; `fixed: false` counts as failure.
    Fix,
    /// Produces a plan document under `plan`.
    Plan,
    /// Reviews changes; reports `issues`.
    Review,
    /// Records a commit; reports `commit` and `files`.
    Commit,
    /// Breaks work into `tasks`.
    Epic,
    /// Anything else.
    Generic,
}

impl WorkflowKind {
    /// Kind for a registration name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "code" => Self::Code,
            "fix" => Self::Fix,
            "plan" => Self::Plan,
            "review" => Self::Review,
            "commit" => Self::Commit,
            "epic" => Self::Epic,
            _ => Self::Generic,
        }
    }

    /// Fold raw workflow output into the canonical result.
    #[must_use]
    pub fn normalize(self, raw: &Value) -> WorkflowExecutionResult {
        let mut result = generic(raw);
        match self {
            Self::Code => {
                if result.files_modified.is_empty() {
                    result.files_modified = change_paths(raw);
                }
            }
            Self::Fix => {
                if raw.get("fixed").and_then(Value::as_bool) == Some(false) {
                    result.success = false;
                    result
                        .error
                        .get_or_insert_with(|| "fix was not applied".to_owned());
                }
            }
            Self::Plan => {
                if let Some(plan) = raw.get("plan") {
                    result.data = Some(plan.clone());
                }
                result.files_modified.clear();
            }
            Self::Review => {
                if let Some(issues) = raw.get("issues").and_then(Value::as_array) {
                    if result.output.is_none() {
                        result.output = Some(format!("{} issue(s) found", issues.len()));
                    }
                    result.data = Some(serde_json::json!({ "issues": issues }));
                }
            }
            Self::Commit => {
                if let Some(sha) = raw.get("commit").and_then(Value::as_str) {
                    result.output.get_or_insert_with(|| format!("committed {sha}"));
                }
                if result.files_modified.is_empty() {
                    result.files_modified = string_list(raw.get("files"));
                }
            }
            Self::Epic => {
                if let Some(tasks) = raw.get("tasks").and_then(Value::as_array) {
                    result
                        .output
                        .get_or_insert_with(|| format!("{} task(s) created", tasks.len()));
                    result.data = Some(serde_json::json!({ "tasks": tasks }));
                }
            }
            Self::Generic => {}
        }
        result
    }
}

/// Shape shared by every workflow: `success`, `error`, `output`/`summary`
/// /`stdout`, `files_modified`. Missing `success` means the workflow
/// returned normally and is taken as success.
fn generic(raw: &Value) -> WorkflowExecutionResult {
    let error = raw.get("error").and_then(Value::as_str).map(str::to_owned);
    let success = raw
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(error.is_none());
    let output = ["output", "summary", "stdout"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    let error = match error {
        None if !success => raw
            .get("stderr")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .or_else(|| Some("workflow reported failure".to_owned())),
        other => other,
    };
    let data = match raw {
        Value::Null => None,
        other => Some(other.get("data").cloned().unwrap_or_else(|| other.clone())),
    };

    WorkflowExecutionResult {
        success,
        data,
        output,
        error,
        files_modified: string_list(raw.get("files_modified")),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn change_paths(raw: &Value) -> Vec<String> {
    raw.get("changes")
        .and_then(Value::as_array)
        .map(|changes| {
            changes
                .iter()
                .filter_map(|c| c.get("path").and_then(Value::as_str))
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

struct Registration {
    kind: WorkflowKind,
    workflow: Arc<dyn Workflow>,
}

/// Name-to-workflow dispatch table.
pub struct WorkflowAdapter {
    workflows: HashMap<String, Registration>,
    safety: Arc<dyn SafetyCheck>,
}

impl Default for WorkflowAdapter {
    fn default() -> Self {
        Self::new(Arc::new(AllowAll))
    }
}

impl WorkflowAdapter {
    /// Empty table consulting `safety` before each dispatch.
    #[must_use]
    pub fn new(safety: Arc<dyn SafetyCheck>) -> Self {
        Self {
            workflows: HashMap::new(),
            safety,
        }
    }

    /// Register `workflow` under `name`, replacing any earlier entry.
    pub fn register(&mut self, name: impl Into<String>, workflow: Arc<dyn Workflow>) -> &mut Self {
        let name = name.into();
        let kind = WorkflowKind::from_name(&name);
        debug!(workflow = %name, ?kind, "workflow registered");
        if self
            .workflows
            .insert(name.clone(), Registration { kind, workflow })
            .is_some()
        {
            warn!(workflow = %name, "workflow registration replaced");
        }
        self
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run workflow `name` and normalize its output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if `cancel` has already fired or the
    /// workflow stopped on cancellation, `AppError::UnknownWorkflow` for an
    /// unregistered name, `AppError::SafetyViolation` if the safety check
    /// refuses the call, or `AppError::WorkflowInvocation` wrapping any
    /// other workflow error.
    pub async fn invoke_workflow(
        &self,
        name: &str,
        input: Value,
        context: WorkflowContext,
        cancel: Option<&CancellationToken>,
    ) -> Result<WorkflowExecutionResult> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(AppError::Cancelled(format!(
                "{name} workflow for task {}",
                context.task_id
            )));
        }

        let registration = self
            .workflows
            .get(name)
            .ok_or_else(|| AppError::UnknownWorkflow(name.to_owned()))?;

        self.safety.check(name, &input)?;

        let span = info_span!("invoke_workflow", workflow = name, task_id = %context.task_id);
        let token = cancel.cloned().unwrap_or_default();
        let raw = registration
            .workflow
            .run(input, context, token)
            .instrument(span)
            .await
            .map_err(|err| match err {
                AppError::Cancelled(what) => AppError::Cancelled(what),
                other => AppError::WorkflowInvocation {
                    workflow: name.to_owned(),
                    cause: other.to_string(),
                },
            })?;

        let result = registration.kind.normalize(&raw);
        info!(
            workflow = name,
            success = result.success,
            files_modified = result.files_modified.len(),
            "workflow finished"
        );
        Ok(result)
    }

    /// Like [`invoke_workflow`](Self::invoke_workflow) but bounded by
    /// `timeout`. Expiry cancels the workflow's token and yields a
    /// `success = false` result instead of an error.
    ///
    /// # Errors
    ///
    /// Propagates every error except the timeout.
    pub async fn invoke_workflow_with_timeout(
        &self,
        name: &str,
        input: Value,
        context: WorkflowContext,
        timeout: Duration,
    ) -> Result<WorkflowExecutionResult> {
        let token = CancellationToken::new();
        let task_id = context.task_id.clone();
        match tokio::time::timeout(timeout, self.invoke_workflow(name, input, context, Some(&token)))
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                token.cancel();
                warn!(
                    workflow = name,
                    task_id = %task_id,
                    timeout_ms = timeout.as_millis(),
                    "workflow timed out"
                );
                Ok(WorkflowExecutionResult::failed(format!(
                    "{name} workflow timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}
