//! Interfaces to the collaborators the orchestrator drives.
//!
//! The orchestration core never discovers, plans, or edits code itself.
//! It talks to those engines through the traits below, so the loop can be
//! driven by the bundled implementations ([`inbox`], [`planner`],
//! [`host_cli`]) or by test doubles.

pub mod backoff;
pub mod host_cli;
pub mod inbox;
pub mod planner;

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::models::plan::Plan;
use crate::models::task::Task;
use crate::models::workflow::WorkflowContext;
use crate::Result;

/// Boxed, sendable future returned by collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Options passed to [`Discovery::discover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Allow the source to skip tasks it already reported.
    pub use_cache: bool,
}

/// Source of candidate tasks, owning its own backoff schedule.
pub trait Discovery: Send + Sync {
    /// Produce the current set of candidate tasks.
    ///
    /// # Errors
    ///
    /// Implementations return any error that prevented discovery; the loop
    /// treats it like an empty result.
    fn discover(&self, options: DiscoveryOptions) -> BoxFuture<'_, Result<Vec<Task>>>;

    /// Seconds the loop should wait before the next iteration.
    fn backoff_seconds(&self) -> u64;

    /// Lengthen the wait after an iteration that found nothing.
    fn increase_backoff(&self);

    /// Return to the initial wait after an iteration that found work.
    fn reset_backoff(&self);

    /// Record that `ids` are now tracked in the session state.
    ///
    /// Sources that cache reported ids should only add them here, so a
    /// task whose plan never got enqueued is offered again.
    fn acknowledge(&self, _ids: &[String]) {}
}

/// Turns a task set into an ordered plan.
pub trait Planner: Send + Sync {
    /// Build a plan for `goal` covering `tasks`.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid plan can be built (e.g. dependency cycle).
    fn create_plan(&self, goal: &str, tasks: Vec<Task>) -> BoxFuture<'_, Result<Plan>>;
}

/// An external workflow implementation, invoked only through the adapter.
///
/// Each workflow returns its own JSON shape; the adapter normalizes it.
/// The token is advisory: a workflow should poll it (or select on
/// [`CancellationToken::cancelled`]) and stop early when it fires.
pub trait Workflow: Send + Sync {
    /// Run the workflow.
    ///
    /// # Errors
    ///
    /// Returns any failure raised by the workflow; the adapter wraps it.
    fn run(
        &self,
        input: serde_json::Value,
        context: WorkflowContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}
