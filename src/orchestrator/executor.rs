//! Bounded, cancellable execution of a single task.
//!
//! The workflow runs on its own tokio task, raced against the task
//! timeout. When the timer wins, the task's cancellation token is fired
//! and the executor reports failure straight away; the workflow task is
//! detached rather than aborted, so a workflow that ignores its token
//! keeps running in the background until it returns on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::workflow_adapter::WorkflowAdapter;
use crate::models::state::AgentState;
use crate::models::task::Task;
use crate::models::workflow::{WorkflowContext, WorkflowExecutionResult};
use crate::AppError;

type RunningTable = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Removes a task's token from the in-flight table when dropped.
struct RunningGuard {
    table: RunningTable,
    task_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.task_id);
    }
}

fn lock(table: &RunningTable) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs tasks through the workflow adapter under a timeout.
pub struct TaskExecutor {
    adapter: Arc<WorkflowAdapter>,
    running: RunningTable,
    timeout_override: Option<Duration>,
}

impl TaskExecutor {
    /// Executor dispatching through `adapter`, with timeouts taken from
    /// each state's resource limits.
    #[must_use]
    pub fn new(adapter: Arc<WorkflowAdapter>) -> Self {
        Self {
            adapter,
            running: Arc::new(Mutex::new(HashMap::new())),
            timeout_override: None,
        }
    }

    /// Use `timeout` for every task regardless of configured limits.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// The adapter tasks are dispatched through.
    #[must_use]
    pub fn adapter(&self) -> &Arc<WorkflowAdapter> {
        &self.adapter
    }

    /// Run `task` through its workflow. Never fails: every error, panic,
    /// cancellation, or timeout becomes a `success = false` result.
    pub async fn execute(&self, task: &Task, state: &AgentState) -> WorkflowExecutionResult {
        let timeout = self
            .timeout_override
            .unwrap_or_else(|| state.config.resource_limits.task_timeout());
        let span = info_span!(
            "execute_task",
            session_id = %state.session_id,
            task_id = %task.id,
            workflow = %task.workflow
        );

        async move {
            let token = CancellationToken::new();
            {
                let mut running = lock(&self.running);
                if running.contains_key(&task.id) {
                    warn!("task is already running");
                    return failure(&task.id, "task is already running");
                }
                running.insert(task.id.clone(), token.clone());
            }
            let _guard = RunningGuard {
                table: Arc::clone(&self.running),
                task_id: task.id.clone(),
            };

            let context = WorkflowContext {
                session_id: state.session_id.clone(),
                task_id: task.id.clone(),
                task_title: task.title.clone(),
                task_description: task.description.clone(),
                workspace_root: state.config.workspace_root.clone(),
                iteration: state.session.iteration,
            };
            let adapter = Arc::clone(&self.adapter);
            let workflow = task.workflow.clone();
            let input = task.workflow_input.clone();
            let task_token = token.clone();

            let mut handle = tokio::spawn(
                async move {
                    adapter
                        .invoke_workflow(&workflow, input, context, Some(&task_token))
                        .await
                }
                .in_current_span(),
            );

            info!(timeout_ms = timeout.as_millis(), "task started");
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(Ok(result))) => {
                    info!(success = result.success, "task finished");
                    result
                }
                Ok(Ok(Err(err))) => {
                    warn!(%err, "task failed");
                    failure(&task.id, err)
                }
                Ok(Err(join_err)) => {
                    warn!(%join_err, "workflow task aborted");
                    failure(&task.id, format!("workflow task aborted: {join_err}"))
                }
                Err(_elapsed) => {
                    token.cancel();
                    warn!(
                        timeout_ms = timeout.as_millis(),
                        "task timed out, workflow detached"
                    );
                    failure(
                        &task.id,
                        format!("timed out after {}ms", timeout.as_millis()),
                    )
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fire the cancellation token of a running task.
    ///
    /// Returns `false` if the task is not running.
    pub fn cancel(&self, task_id: &str) -> bool {
        match lock(&self.running).get(task_id) {
            Some(token) => {
                token.cancel();
                info!(task_id, "task cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Fire every running task's token. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let running = lock(&self.running);
        for token in running.values() {
            token.cancel();
        }
        if !running.is_empty() {
            info!(count = running.len(), "cancelling all running tasks");
        }
        running.len()
    }

    /// Whether `task_id` is currently executing.
    #[must_use]
    pub fn is_running(&self, task_id: &str) -> bool {
        lock(&self.running).contains_key(task_id)
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }
}

fn failure(task_id: &str, cause: impl ToString) -> WorkflowExecutionResult {
    WorkflowExecutionResult::failed(
        AppError::TaskExecution {
            task_id: task_id.to_owned(),
            cause: cause.to_string(),
        }
        .to_string(),
    )
}
