//! Host CLI workflow.
//!
//! Runs the configured agent CLI (e.g. `claude -p`) once per task with a
//! prompt built from the task, inside the workspace root. The workflow
//! cooperates with cancellation: when the token fires the child process is
//! killed.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{BoxFuture, Workflow};
use crate::config::HostConfig;
use crate::models::workflow::WorkflowContext;
use crate::{AppError, Result};

/// Upper bound on captured stdout/stderr per stream.
const MAX_CAPTURE_BYTES: u64 = 64 * 1024;

/// Workflow that delegates to an external agent CLI.
#[derive(Debug, Clone)]
pub struct HostCliWorkflow {
    name: String,
    host: HostConfig,
}

impl HostCliWorkflow {
    /// Bind workflow `name` to the host CLI.
    #[must_use]
    pub fn new(name: impl Into<String>, host: HostConfig) -> Self {
        Self {
            name: name.into(),
            host,
        }
    }

    /// Prompt sent to the CLI.
    ///
    /// An explicit `prompt` string in the workflow input wins; otherwise
    /// the prompt is assembled from the task title and description.
    #[must_use]
    pub fn build_prompt(&self, input: &serde_json::Value, context: &WorkflowContext) -> String {
        if let Some(prompt) = input.get("prompt").and_then(serde_json::Value::as_str) {
            return prompt.to_owned();
        }
        let mut prompt = format!(
            "[{} workflow] Task {}: {}",
            self.name, context.task_id, context.task_title
        );
        if !context.task_description.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&context.task_description);
        }
        prompt
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        context: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let prompt = self.build_prompt(&input, &context);
        let invocation_id = Uuid::new_v4().to_string();

        let mut cmd = Command::new(&self.host.cli);
        cmd.args(&self.host.args)
            .arg(&prompt)
            .env("AUTOPILOT_SESSION_ID", &context.session_id)
            .env("AUTOPILOT_TASK_ID", &context.task_id)
            .env("AUTOPILOT_WORKFLOW", &self.name)
            .env("AUTOPILOT_INVOCATION_ID", &invocation_id)
            .current_dir(&context.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Io(format!("failed to spawn {}: {err}", self.host.cli)))?;

        info!(
            pid = child.id().unwrap_or(0),
            host_cli = %self.host.cli,
            invocation_id = %invocation_id,
            "host cli spawned"
        );

        let stdout = tokio::spawn(capture(child.stdout.take()));
        let stderr = tokio::spawn(capture(child.stderr.take()));

        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            () = cancel.cancelled() => None,
        };

        let Some(status) = finished else {
            warn!("cancellation requested, killing host cli");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill host cli");
            }
            return Err(AppError::Cancelled(format!(
                "{} workflow for task {}",
                self.name, context.task_id
            )));
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        Ok(serde_json::json!({
            "success": status.success(),
            "exit_code": status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

async fn capture<R>(stream: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return String::new();
    };
    let mut limited = stream.take(MAX_CAPTURE_BYTES);
    let mut buf = Vec::new();
    if let Err(err) = limited.read_to_end(&mut buf).await {
        warn!(%err, "failed to read host cli output");
    }
    // Keep draining so the child never blocks on a full pipe.
    let mut rest = limited.into_inner();
    match tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
        Ok(0) => {}
        Ok(dropped) => debug!(dropped, "host cli output truncated"),
        Err(err) => warn!(%err, "failed to drain host cli output"),
    }
    String::from_utf8_lossy(&buf).into_owned()
}

impl Workflow for HostCliWorkflow {
    fn run(
        &self,
        input: serde_json::Value,
        context: WorkflowContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let span = info_span!("host_cli_workflow", workflow = %self.name, task_id = %context.task_id);
        Box::pin(self.execute(input, context, cancel).instrument(span))
    }
}
