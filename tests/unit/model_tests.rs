use agent_autopilot::models::plan::Plan;
use agent_autopilot::models::state::{
    AgentConfig, AgentMode, AgentState, StateUpdate, TaskList, REQUIRED_FIELDS,
};
use agent_autopilot::models::task::{
    Task, TaskComplexity, TaskPriority, TaskStatus, TaskUpdate,
};
use agent_autopilot::AppError;

// ── Task lifecycle ───────────────────────────────────────────

#[test]
fn priority_and_complexity_are_ordered() {
    assert!(TaskPriority::Low < TaskPriority::Medium);
    assert!(TaskPriority::High < TaskPriority::Critical);
    assert!(TaskComplexity::Trivial < TaskComplexity::Simple);
    assert!(TaskComplexity::Moderate < TaskComplexity::Complex);
}

#[test]
fn allowed_transitions() {
    use TaskStatus::{Blocked, Completed, Failed, Pending, Running};

    for next in [Running, Blocked, Completed, Failed] {
        assert!(Pending.can_transition_to(next), "pending -> {next:?}");
    }
    for next in [Completed, Failed, Blocked, Pending] {
        assert!(Running.can_transition_to(next), "running -> {next:?}");
    }
    for next in [Pending, Running, Failed] {
        assert!(Blocked.can_transition_to(next), "blocked -> {next:?}");
    }
    assert!(!Blocked.can_transition_to(Completed));
    for status in [Pending, Running, Completed, Failed, Blocked] {
        assert!(status.can_transition_to(status));
    }
}

#[test]
fn terminal_task_rejects_reopening() {
    let task = Task::new("1", "done", "code")
        .with_status(TaskStatus::Completed)
        .expect("pending -> completed");
    let err = task
        .with_status(TaskStatus::Running)
        .expect_err("completed is terminal");
    assert!(matches!(
        err,
        AppError::StateTransition { ref entity, ref from, ref to }
            if entity == "task 1" && from == "completed" && to == "running"
    ));
}

#[test]
fn task_update_merges_fields_and_checks_status() {
    let task = Task::new("2", "old title", "fix");
    let mut update = TaskUpdate::status(TaskStatus::Running);
    update.title = Some("new title".into());
    update
        .metadata
        .insert("attempt".into(), serde_json::json!(2));

    let updated = update.apply(&task).expect("valid update");
    assert_eq!(updated.id, "2");
    assert_eq!(updated.title, "new title");
    assert_eq!(updated.status, TaskStatus::Running);
    assert_eq!(updated.metadata["attempt"], serde_json::json!(2));
    assert_eq!(task.title, "old title");

    let failed = TaskUpdate::status(TaskStatus::Failed)
        .apply(&updated)
        .expect("running -> failed");
    assert!(TaskUpdate::status(TaskStatus::Pending).apply(&failed).is_err());
}

#[test]
fn task_deserializes_with_defaults() {
    let task: Task = serde_json::from_value(serde_json::json!({
        "id": "4.1",
        "title": "Add retries",
        "type": "feature",
        "priority": "high",
        "workflow": "code",
        "dependencies": ["4"],
        "files": ["src/net.rs"]
    }))
    .expect("task json");

    assert_eq!(task.kind, "feature");
    assert_eq!(task.priority, TaskPriority::High);
    assert_eq!(task.complexity, TaskComplexity::Moderate);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.dependencies.contains("4"));
    assert_eq!(task.parent_id(), Some("4"));
    assert!(task.is_subtask_of("4"));
}

// ── Plan invariants ──────────────────────────────────────────

fn plan_with(order: Vec<Vec<&str>>) -> Plan {
    Plan {
        goal: "g".into(),
        tasks: vec![Task::new("a", "A", "code"), Task::new("b", "B", "code")],
        execution_order: order
            .into_iter()
            .map(|phase| phase.into_iter().map(str::to_owned).collect())
            .collect(),
        ..Plan::default()
    }
}

#[test]
fn valid_plan_passes() {
    let plan = plan_with(vec![vec!["a"], vec!["b"]]);
    plan.validate().expect("valid");
    assert_eq!(plan.scheduled_count(), 2);
}

#[test]
fn plan_with_unknown_id_is_invalid() {
    let err = plan_with(vec![vec!["a", "ghost"]])
        .validate()
        .expect_err("unknown id");
    assert!(matches!(err, AppError::InvalidPlan(ref msg) if msg.contains("ghost")));
}

#[test]
fn plan_with_repeated_id_is_invalid() {
    let err = plan_with(vec![vec!["a"], vec!["b", "a"]])
        .validate()
        .expect_err("repeated id");
    assert!(matches!(err, AppError::InvalidPlan(ref msg) if msg.contains("task a")));
}

// ── Agent state ──────────────────────────────────────────────

fn state() -> AgentState {
    AgentState::new("s1".into(), AgentConfig::default(), 10, 1)
}

#[test]
fn fresh_state_is_idle_and_empty() {
    let state = state();
    assert_eq!(state.current_mode, AgentMode::Idle);
    assert_eq!(state.session.id, "s1");
    assert_eq!(state.session.pid, 10);
    assert_eq!(state.task_count(), 0);
    assert!(state.timestamps.mode_transitions.is_empty());
}

#[test]
fn serialized_state_has_required_fields() {
    let value = serde_json::to_value(state()).expect("serialize");
    let fields = value.as_object().expect("object");
    for field in REQUIRED_FIELDS {
        assert!(fields.contains_key(field), "missing {field}");
    }
}

#[test]
fn merge_records_mode_transitions() {
    let base = state();
    let next = StateUpdate {
        current_mode: Some(AgentMode::Running),
        ..StateUpdate::default()
    }
    .merge(&base);

    assert_eq!(next.current_mode, AgentMode::Running);
    assert_eq!(next.timestamps.mode_transitions.len(), 1);
    assert_eq!(next.timestamps.mode_transitions[0].from, AgentMode::Idle);
    assert!(next.timestamps.last_activity >= base.timestamps.last_activity);
    assert_eq!(base.current_mode, AgentMode::Idle);

    let same = StateUpdate {
        current_mode: Some(AgentMode::Running),
        ..StateUpdate::default()
    }
    .merge(&next);
    assert_eq!(same.timestamps.mode_transitions.len(), 1);
}

#[test]
fn duplicate_ids_are_detected_across_lists() {
    let mut state = state();
    state.task_queue.push(Task::new("x", "X", "code"));
    assert_eq!(state.duplicate_task_id(), None);
    state.completed_tasks.push(Task::new("x", "X", "code"));
    assert_eq!(state.duplicate_task_id(), Some("x".into()));
    assert_eq!(state.find_task("x").map(|(list, _)| list), Some(TaskList::Queue));
}

#[test]
fn list_entry_statuses() {
    assert_eq!(TaskList::Queue.entry_status(), TaskStatus::Pending);
    assert_eq!(TaskList::Completed.entry_status(), TaskStatus::Completed);
    assert_eq!(TaskList::Failed.entry_status(), TaskStatus::Failed);
    assert_eq!(TaskList::Blocked.entry_status(), TaskStatus::Blocked);
}
