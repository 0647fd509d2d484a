//! The discover, plan, execute cycle.
//!
//! [`ContinuousImprovementLoop::start`] repeats iterations until
//! [`stop`](ContinuousImprovementLoop::stop) is called. An iteration that
//! finds no work lengthens the discovery backoff; one that finds work
//! resets it, builds a plan, and runs the plan phase by phase. Tasks run
//! sequentially and a single failure never aborts the plan. An iteration
//! that fails outright (state persistence, typically) is logged and
//! backed off like an empty one; only a stop request ends the loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::executor::TaskExecutor;
use super::state_manager::AgentStateManager;
use crate::collaborators::{Discovery, DiscoveryOptions, Planner};
use crate::models::plan::Plan;
use crate::models::resource::{LimitExceeded, LimitKind};
use crate::models::state::{AgentMode, AgentState, ExecutionRecord, TaskList};
use crate::models::task::{TaskStatus, TaskUpdate};
use crate::{AppError, Result};

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Tasks returned by discovery.
    pub discovered: usize,
    /// Outcome of the plan, if one ran.
    pub execution: Option<ExecutionSummary>,
}

/// What [`ContinuousImprovementLoop::execute_plan`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Tasks moved to completed.
    pub completed: Vec<String>,
    /// Tasks moved to failed.
    pub failed: Vec<String>,
    /// Tasks moved to blocked because a dependency failed.
    pub blocked: Vec<String>,
    /// Scheduled tasks that were not in the queue.
    pub skipped: Vec<String>,
    /// Whether execution ended early on a stop request.
    pub interrupted: bool,
}

/// Drives discovery, planning, and execution until stopped.
pub struct ContinuousImprovementLoop {
    discovery: Arc<dyn Discovery>,
    planner: Arc<dyn Planner>,
    executor: Arc<TaskExecutor>,
    state: Arc<AgentStateManager>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    paused: AtomicBool,
    iterations: AtomicU64,
}

impl ContinuousImprovementLoop {
    /// Loop wired to its collaborators.
    #[must_use]
    pub fn new(
        discovery: Arc<dyn Discovery>,
        planner: Arc<dyn Planner>,
        executor: Arc<TaskExecutor>,
        state: Arc<AgentStateManager>,
    ) -> Self {
        Self {
            discovery,
            planner,
            executor,
            state,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
        }
    }

    /// Run iterations until [`stop`](Self::stop) is called.
    ///
    /// A stop requested before `start` makes it return without iterating.
    /// The request is consumed when `start` returns, so the loop can be
    /// started again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateTransition` if the loop is already running.
    pub async fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::StateTransition {
                entity: "loop".into(),
                from: AgentMode::Running.as_str().into(),
                to: AgentMode::Running.as_str().into(),
            });
        }

        self.run().await;

        if let Err(err) = self.state.record_mode_transition(AgentMode::Idle) {
            warn!(%err, "failed to record idle mode");
        }
        self.paused.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        info!(iterations = self.iteration_count(), "loop stopped");
        Ok(())
    }

    async fn run(&self) {
        if let Err(err) = self.state.record_mode_transition(AgentMode::Running) {
            warn!(%err, "failed to record running mode");
        }
        info!("loop started");

        while !self.stop_requested() {
            if self.paused.load(Ordering::SeqCst) {
                debug!("loop paused, skipping discovery");
            } else if let Err(err) = self.iteration().await {
                error!(%err, "iteration failed, backing off");
                self.discovery.increase_backoff();
            }
            if self.stop_requested() {
                break;
            }
            self.wait_between_iterations().await;
        }
    }

    /// Request the loop to end after the current task. Called before
    /// [`start`](Self::start), it makes the next `start` return at once.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_running() {
            info!("stop requested");
            if let Err(err) = self.state.record_mode_transition(AgentMode::Stopping) {
                warn!(%err, "failed to record stopping mode");
            }
        }
    }

    /// Skip discovery on later iterations until [`resume`](Self::resume).
    pub fn pause(&self) {
        if self.is_running() && !self.paused.swap(true, Ordering::SeqCst) {
            info!("loop paused");
            if let Err(err) = self.state.record_mode_transition(AgentMode::Paused) {
                warn!(%err, "failed to record paused mode");
            }
        }
    }

    /// Undo [`pause`](Self::pause).
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) && self.is_running() {
            info!("loop resumed");
            if let Err(err) = self.state.record_mode_transition(AgentMode::Running) {
                warn!(%err, "failed to record running mode");
            }
        }
    }

    /// Whether [`start`](Self::start) is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Iterations run by this loop instance.
    #[must_use]
    pub fn iteration_count(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Current mode, derived from the control flags.
    #[must_use]
    pub fn mode(&self) -> AgentMode {
        if !self.is_running() {
            AgentMode::Idle
        } else if self.stop_requested() {
            AgentMode::Stopping
        } else if self.paused.load(Ordering::SeqCst) {
            AgentMode::Paused
        } else {
            AgentMode::Running
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Run one discover, plan, execute cycle.
    ///
    /// # Errors
    ///
    /// Returns state persistence errors. Discovery and planning failures
    /// are logged and treated as finding no work.
    pub async fn iteration(&self) -> Result<IterationReport> {
        let number = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        let span = info_span!("iteration", iteration = number);

        async move {
            let state = self.state.record_iteration()?;

            let tasks = match self
                .discovery
                .discover(DiscoveryOptions { use_cache: true })
                .await
            {
                Ok(tasks) => tasks,
                Err(err) => {
                    warn!(%err, "discovery failed");
                    Vec::new()
                }
            };
            let mut report = IterationReport {
                discovered: tasks.len(),
                execution: None,
            };

            if tasks.is_empty() {
                self.discovery.increase_backoff();
                debug!(
                    backoff_secs = self.discovery.backoff_seconds(),
                    "no tasks discovered"
                );
                return Ok(report);
            }
            self.discovery.reset_backoff();

            let plan = match self.planner.create_plan(&state.config.goal, tasks).await {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(%err, "planning failed");
                    self.discovery.increase_backoff();
                    return Ok(report);
                }
            };
            if let Err(err) = plan.validate() {
                warn!(%err, "planner produced an invalid plan");
                self.discovery.increase_backoff();
                return Ok(report);
            }

            report.execution = Some(self.execute_plan(&plan).await?);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Enqueue the plan's tasks and run them phase by phase.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidPlan` for a structurally invalid plan or
    /// any state persistence error. Task failures are recorded, not
    /// returned.
    pub async fn execute_plan(&self, plan: &Plan) -> Result<ExecutionSummary> {
        plan.validate()?;
        self.state.enqueue_tasks(&plan.tasks)?;
        let ids: Vec<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        self.discovery.acknowledge(&ids);
        info!(
            tasks = plan.scheduled_count(),
            phases = plan.execution_order.len(),
            "executing plan"
        );

        let mut summary = ExecutionSummary::default();
        for (index, phase) in plan.execution_order.iter().enumerate() {
            debug!(phase = index, tasks = phase.len(), "starting phase");
            for task_id in phase {
                if self.stop_requested() {
                    info!(task_id = %task_id, "stop requested, leaving remaining tasks queued");
                    summary.interrupted = true;
                    return Ok(summary);
                }
                self.run_task(task_id, &mut summary).await?;
                if self.files_limit_reached()? {
                    summary.interrupted = true;
                    return Ok(summary);
                }
            }
        }

        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            blocked = summary.blocked.len(),
            "plan finished"
        );
        Ok(summary)
    }

    async fn run_task(&self, task_id: &str, summary: &mut ExecutionSummary) -> Result<()> {
        let snapshot = self.current_state()?;
        let queued = snapshot
            .task_queue
            .iter()
            .find(|t| t.id == task_id && !t.status.is_terminal());
        let Some(task) = queued else {
            debug!(task_id, "task is not queued, skipping");
            summary.skipped.push(task_id.to_owned());
            return Ok(());
        };

        let unmet = task.dependencies.iter().find(|dep| {
            snapshot.failed_tasks.iter().any(|t| &t.id == *dep)
                || snapshot.blocked_tasks.iter().any(|t| &t.id == *dep)
        });
        if let Some(dep) = unmet {
            warn!(task_id, dependency = %dep, "dependency did not succeed, blocking task");
            self.state
                .move_task(task_id, TaskList::Queue, TaskList::Blocked)?;
            summary.blocked.push(task_id.to_owned());
            return Ok(());
        }

        let running = self
            .state
            .update_task(task_id, &TaskUpdate::status(TaskStatus::Running))?;
        let Some((_, task)) = running.find_task(task_id) else {
            return Err(AppError::NotFound(format!("task {task_id} vanished")));
        };
        let task = task.clone();

        let started = Instant::now();
        let result = self.executor.execute(&task, &running).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.state.record_execution(ExecutionRecord {
            task_id: task.id.clone(),
            workflow: task.workflow.clone(),
            success: result.success,
            duration_ms,
            error: result.error.clone(),
            files_modified: result.files_modified.clone(),
            finished_at: Utc::now(),
        })?;

        if result.success {
            self.state
                .move_task(task_id, TaskList::Queue, TaskList::Completed)?;
            summary.completed.push(task_id.to_owned());
        } else {
            self.state
                .move_task(task_id, TaskList::Queue, TaskList::Failed)?;
            summary.failed.push(task_id.to_owned());
        }
        Ok(())
    }

    fn current_state(&self) -> Result<AgentState> {
        self.state
            .get_state()?
            .ok_or_else(|| AppError::NotFound("agent state has not been initialized".into()))
    }

    /// Stop the loop once the session has modified as many files as allowed.
    fn files_limit_reached(&self) -> Result<bool> {
        let state = self.current_state()?;
        let Some(max) = state.config.resource_limits.max_files_modified else {
            return Ok(false);
        };
        let current = state.metrics.files_modified;
        if current < max {
            return Ok(false);
        }
        #[allow(clippy::cast_precision_loss)] // File counts stay far below 2^52.
        let breach = LimitExceeded::new(LimitKind::FilesModified, current as f64, max as f64);
        error!(limit = %breach.limit, current, max, "{}", breach.message);
        self.stop();
        Ok(true)
    }

    /// Sleep for the discovery backoff in one-second slices, returning
    /// early once a stop is requested.
    pub async fn wait_between_iterations(&self) {
        let seconds = self.discovery.backoff_seconds();
        debug!(seconds, "waiting before next iteration");
        if seconds == 0 {
            tokio::task::yield_now().await;
            return;
        }
        for _ in 0..seconds {
            if self.stop_requested() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
