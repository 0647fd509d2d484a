//! Safety checks consulted before a workflow is dispatched.
//!
//! The approval policy itself lives outside the orchestrator; the adapter
//! only needs a yes/no answer per invocation. [`DenyListPolicy`] is the
//! bundled implementation: it refuses workflows by name and, optionally,
//! any invocation whose input is flagged `destructive` unless the workflow
//! is explicitly trusted.

use std::collections::HashSet;

use tracing::{info, info_span};

use crate::{AppError, Result};

/// Authorizes workflow invocations.
pub trait SafetyCheck: Send + Sync {
    /// Decide whether `workflow` may run with `input`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SafetyViolation` when the invocation is refused.
    fn check(&self, workflow: &str, input: &serde_json::Value) -> Result<()>;
}

/// Policy that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SafetyCheck for AllowAll {
    fn check(&self, _workflow: &str, _input: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Refuses denied workflow names and untrusted destructive inputs.
#[derive(Debug, Default, Clone)]
pub struct DenyListPolicy {
    denied: HashSet<String>,
    trusted_destructive: HashSet<String>,
}

impl DenyListPolicy {
    /// Policy denying every name in `denied`.
    #[must_use]
    pub fn new<I, S>(denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: denied.into_iter().map(Into::into).collect(),
            trusted_destructive: HashSet::new(),
        }
    }

    /// Allow `workflow` to run inputs flagged `"destructive": true`.
    #[must_use]
    pub fn trust_destructive(mut self, workflow: impl Into<String>) -> Self {
        self.trusted_destructive.insert(workflow.into());
        self
    }
}

impl SafetyCheck for DenyListPolicy {
    fn check(&self, workflow: &str, input: &serde_json::Value) -> Result<()> {
        let _span = info_span!("safety_check", workflow).entered();

        if self.denied.contains(workflow) {
            info!("workflow is on the deny list");
            return Err(AppError::SafetyViolation {
                workflow: workflow.to_owned(),
                reason: "workflow is denied by configuration".into(),
            });
        }

        let destructive = input
            .get("destructive")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if destructive && !self.trusted_destructive.contains(workflow) {
            info!("destructive input from untrusted workflow");
            return Err(AppError::SafetyViolation {
                workflow: workflow.to_owned(),
                reason: "destructive operation requires a trusted workflow".into(),
            });
        }

        Ok(())
    }
}
