//! Durable agent session state.
//!
//! [`AgentState`] is the single record persisted by the state manager. It
//! is never edited in place: callers describe a change as a
//! [`StateUpdate`] and the manager swaps in the merged copy.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Task, TaskStatus};

/// Default per-task execution bound when no limit is configured.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Operating mode of the improvement loop.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Not looping.
    #[default]
    Idle,
    /// Actively discovering and executing.
    Running,
    /// Looping but skipping discovery until resumed.
    Paused,
    /// Stop requested, finishing the current task.
    Stopping,
}

impl AgentMode {
    /// Snake-case name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        }
    }
}

/// Resource limits as configured by the operator (megabytes and minutes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceLimits {
    /// Resident memory ceiling in MB.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    /// Total session wall-clock ceiling in minutes.
    #[serde(default)]
    pub max_session_minutes: Option<u64>,
    /// Per-task execution ceiling in minutes.
    #[serde(default)]
    pub max_task_execution_minutes: Option<u64>,
    /// Ceiling on files modified across the session.
    #[serde(default)]
    pub max_files_modified: Option<u64>,
}

impl ResourceLimits {
    /// Per-task timeout, falling back to [`DEFAULT_TASK_TIMEOUT`].
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        self.max_task_execution_minutes
            .map_or(DEFAULT_TASK_TIMEOUT, minutes_to_duration)
    }

    /// Session wall-clock limit, if configured.
    #[must_use]
    pub fn session_time_limit(&self) -> Option<Duration> {
        self.max_session_minutes.map(minutes_to_duration)
    }
}

fn minutes_to_duration(minutes: u64) -> Duration {
    Duration::from_millis(minutes.saturating_mul(60_000))
}

/// Session configuration captured in the state record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Goal handed to the planner each iteration.
    pub goal: String,
    /// Workspace the workflows operate on.
    pub workspace_root: PathBuf,
    /// Resource limits.
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Idle autosave interval; 0 disables autosave.
    #[serde(default)]
    pub auto_save_seconds: u64,
}

/// Aggregate counters for the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Metrics {
    /// Tasks that finished successfully.
    pub tasks_completed: u64,
    /// Tasks that finished with an error.
    pub tasks_failed: u64,
    /// Sum of task execution time.
    pub total_execution_ms: u64,
    /// `tasks_completed / (tasks_completed + tasks_failed)`, 0 when no tasks ran.
    pub success_rate: f64,
    /// Highest resident memory observed.
    pub peak_memory_mb: u64,
    /// Files reported as modified by workflows.
    pub files_modified: u64,
}

/// One entry of the mode-transition log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ModeTransition {
    /// Previous mode.
    pub from: AgentMode,
    /// New mode.
    pub to: AgentMode,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Session timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Timestamps {
    /// State creation.
    pub started_at: DateTime<Utc>,
    /// Bumped on every update.
    pub last_activity: DateTime<Utc>,
    /// Last successful persist.
    pub last_save: Option<DateTime<Utc>>,
    /// Mode-transition log, oldest first.
    #[serde(default)]
    pub mode_transitions: Vec<ModeTransition>,
}

/// Process-level session bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Session id (mirrors `AgentState::session_id`).
    pub id: String,
    /// Completed loop iterations.
    pub iteration: u64,
    /// Process that last owned the state.
    pub pid: u32,
    /// Parent of that process.
    pub ppid: u32,
}

/// Outcome of a single task execution, kept in the history log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionRecord {
    /// Task that ran.
    pub task_id: String,
    /// Workflow it ran through.
    pub workflow: String,
    /// Whether it succeeded.
    pub success: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Error message on failure.
    pub error: Option<String>,
    /// Files the workflow reported as modified.
    #[serde(default)]
    pub files_modified: Vec<String>,
    /// Completion timestamp.
    pub finished_at: DateTime<Utc>,
}

/// Which of the four task sequences a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskList {
    /// Waiting or running.
    Queue,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Waiting on something external.
    Blocked,
}

impl TaskList {
    /// Status a task carries once it lands in this sequence.
    #[must_use]
    pub fn entry_status(self) -> TaskStatus {
        match self {
            Self::Queue => TaskStatus::Pending,
            Self::Completed => TaskStatus::Completed,
            Self::Failed => TaskStatus::Failed,
            Self::Blocked => TaskStatus::Blocked,
        }
    }

    /// Snake-case name used in logs and errors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// All four sequences, in persistence order.
    pub const ALL: [Self; 4] = [Self::Queue, Self::Completed, Self::Failed, Self::Blocked];
}

/// The durable session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentState {
    /// Session this state belongs to.
    pub session_id: String,
    /// Current loop mode.
    pub current_mode: AgentMode,
    /// Session configuration.
    pub config: AgentConfig,
    /// Pending or running tasks.
    pub task_queue: Vec<Task>,
    /// Successfully finished tasks.
    pub completed_tasks: Vec<Task>,
    /// Tasks that finished with an error.
    pub failed_tasks: Vec<Task>,
    /// Tasks waiting on something external.
    pub blocked_tasks: Vec<Task>,
    /// Per-execution log, oldest first.
    pub execution_history: Vec<ExecutionRecord>,
    /// Aggregate counters.
    pub metrics: Metrics,
    /// Session timestamps.
    pub timestamps: Timestamps,
    /// Process bookkeeping.
    pub session: SessionRecord,
}

/// Top-level fields a persisted state must carry to be considered valid.
pub const REQUIRED_FIELDS: [&str; 11] = [
    "session_id",
    "current_mode",
    "config",
    "task_queue",
    "completed_tasks",
    "failed_tasks",
    "blocked_tasks",
    "execution_history",
    "metrics",
    "timestamps",
    "session",
];

impl AgentState {
    /// Fresh state for a new session.
    #[must_use]
    pub fn new(session_id: String, config: AgentConfig, pid: u32, ppid: u32) -> Self {
        let now = Utc::now();
        Self {
            session: SessionRecord {
                id: session_id.clone(),
                iteration: 0,
                pid,
                ppid,
            },
            session_id,
            current_mode: AgentMode::Idle,
            config,
            task_queue: Vec::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            blocked_tasks: Vec::new(),
            execution_history: Vec::new(),
            metrics: Metrics::default(),
            timestamps: Timestamps {
                started_at: now,
                last_activity: now,
                last_save: None,
                mode_transitions: Vec::new(),
            },
        }
    }

    /// Borrow one of the four task sequences.
    #[must_use]
    pub fn tasks(&self, list: TaskList) -> &[Task] {
        match list {
            TaskList::Queue => &self.task_queue,
            TaskList::Completed => &self.completed_tasks,
            TaskList::Failed => &self.failed_tasks,
            TaskList::Blocked => &self.blocked_tasks,
        }
    }

    /// Mutably borrow one of the four task sequences.
    pub(crate) fn tasks_mut(&mut self, list: TaskList) -> &mut Vec<Task> {
        match list {
            TaskList::Queue => &mut self.task_queue,
            TaskList::Completed => &mut self.completed_tasks,
            TaskList::Failed => &mut self.failed_tasks,
            TaskList::Blocked => &mut self.blocked_tasks,
        }
    }

    /// Locate a task in whichever sequence holds it.
    #[must_use]
    pub fn find_task(&self, id: &str) -> Option<(TaskList, &Task)> {
        TaskList::ALL.into_iter().find_map(|list| {
            self.tasks(list)
                .iter()
                .find(|t| t.id == id)
                .map(|task| (list, task))
        })
    }

    /// Every task id tracked in any sequence.
    #[must_use]
    pub fn tracked_ids(&self) -> HashSet<String> {
        TaskList::ALL
            .into_iter()
            .flat_map(|list| self.tasks(list).iter().map(|t| t.id.clone()))
            .collect()
    }

    /// Total number of tracked tasks, counting duplicates.
    #[must_use]
    pub fn task_count(&self) -> usize {
        TaskList::ALL
            .into_iter()
            .map(|list| self.tasks(list).len())
            .sum()
    }

    /// Return the first id that appears more than once across the sequences.
    #[must_use]
    pub fn duplicate_task_id(&self) -> Option<String> {
        let mut seen = HashSet::new();
        TaskList::ALL
            .into_iter()
            .flat_map(|list| self.tasks(list).iter())
            .find(|t| !seen.insert(t.id.as_str()))
            .map(|t| t.id.clone())
    }

    /// Recompute the success rate from the counters.
    pub(crate) fn refresh_success_rate(&mut self) {
        let total = self.metrics.tasks_completed + self.metrics.tasks_failed;
        self.metrics.success_rate = if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)] // Counters stay far below 2^52.
            let rate = self.metrics.tasks_completed as f64 / total as f64;
            rate
        };
    }
}

/// Partial state change merged by `AgentStateManager::update_state`.
///
/// `None` fields keep the existing value.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// New loop mode.
    pub current_mode: Option<AgentMode>,
    /// Replacement configuration.
    pub config: Option<AgentConfig>,
    /// Replacement queue.
    pub task_queue: Option<Vec<Task>>,
    /// Replacement completed sequence.
    pub completed_tasks: Option<Vec<Task>>,
    /// Replacement failed sequence.
    pub failed_tasks: Option<Vec<Task>>,
    /// Replacement blocked sequence.
    pub blocked_tasks: Option<Vec<Task>>,
    /// Replacement history.
    pub execution_history: Option<Vec<ExecutionRecord>>,
    /// Replacement metrics.
    pub metrics: Option<Metrics>,
    /// Replacement process bookkeeping.
    pub session: Option<SessionRecord>,
}

impl StateUpdate {
    /// Build the merged copy (`base ⊕ self`), leaving `base` untouched.
    #[must_use]
    pub fn merge(self, base: &AgentState) -> AgentState {
        let mut next = base.clone();
        if let Some(mode) = self.current_mode {
            if mode != next.current_mode {
                next.timestamps.mode_transitions.push(ModeTransition {
                    from: next.current_mode,
                    to: mode,
                    at: Utc::now(),
                });
            }
            next.current_mode = mode;
        }
        if let Some(config) = self.config {
            next.config = config;
        }
        if let Some(queue) = self.task_queue {
            next.task_queue = queue;
        }
        if let Some(completed) = self.completed_tasks {
            next.completed_tasks = completed;
        }
        if let Some(failed) = self.failed_tasks {
            next.failed_tasks = failed;
        }
        if let Some(blocked) = self.blocked_tasks {
            next.blocked_tasks = blocked;
        }
        if let Some(history) = self.execution_history {
            next.execution_history = history;
        }
        if let Some(metrics) = self.metrics {
            next.metrics = metrics;
        }
        if let Some(session) = self.session {
            next.session = session;
        }
        next.timestamps.last_activity = Utc::now();
        next
    }
}
