//! Integration tests for durable session state.
//!
//! Exercises the state manager against a real temp directory: creation and
//! reload, the disjoint-sequence rule, corrupt-file handling, crash
//! recovery, metrics folding, and autosave.

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use chrono::Utc;

use agent_autopilot::models::state::{
    AgentMode, ExecutionRecord, ResourceLimits, StateUpdate, TaskList,
};
use agent_autopilot::models::task::{TaskStatus, TaskUpdate};
use agent_autopilot::orchestrator::AgentStateManager;
use agent_autopilot::AppError;

use super::test_helpers::{agent_config, state_manager, task};

fn record(id: &str, success: bool, files: &[&str]) -> ExecutionRecord {
    ExecutionRecord {
        task_id: id.into(),
        workflow: "code".into(),
        success,
        duration_ms: 40,
        error: (!success).then(|| "boom".to_owned()),
        files_modified: files.iter().map(|f| (*f).to_owned()).collect(),
        finished_at: Utc::now(),
    }
}

// ── Create and reload ─────────────────────────────────────────

#[test]
fn initialized_state_survives_a_new_manager() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager
        .enqueue_tasks(&[task("1", "code", &[]), task("2", "fix", &["1"])])
        .expect("enqueue");
    for n in 0..11 {
        manager
            .record_execution(record(&format!("r{n}"), n < 5, &[]))
            .expect("record");
    }

    let reopened = AgentStateManager::new(manager.state_path());
    let loaded = reopened.load_state().expect("load").expect("state present");
    assert_eq!(loaded.session_id, "test");
    assert_eq!(loaded.task_queue.len(), 2);
    assert_eq!(loaded.session.pid, std::process::id());
    assert!(loaded.timestamps.last_save.is_some());
    assert_eq!(Some(loaded), manager.get_state().expect("get"));
}

#[test]
fn load_without_file_is_none() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = AgentStateManager::new(temp.path().join("absent.json"));
    assert!(manager.load_state().expect("load").is_none());
    assert!(manager.get_state().expect("get").is_none());
}

#[test]
fn updates_before_initialization_are_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = AgentStateManager::new(temp.path().join("state.json"));
    let err = manager
        .record_mode_transition(AgentMode::Running)
        .expect_err("uninitialized");
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(matches!(manager.save_state(), Err(AppError::NotFound(_))));
}

#[test]
fn enqueue_skips_ids_already_tracked() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("first");
    manager
        .move_task("1", TaskList::Queue, TaskList::Completed)
        .expect("complete");

    let added = manager
        .enqueue_tasks(&[task("1", "code", &[]), task("2", "code", &[])])
        .expect("second");
    assert_eq!(added, vec!["2".to_owned()]);
    let state = manager.get_state().expect("get").expect("state");
    assert_eq!(state.task_count(), 2);
}

#[test]
fn enqueue_resets_incoming_status_to_pending() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    let mut done = task("1", "code", &[]);
    done.status = TaskStatus::Completed;
    let mut broken = task("2", "code", &[]);
    broken.status = TaskStatus::Failed;

    manager.enqueue_tasks(&[done, broken]).expect("enqueue");
    let state = manager.get_state().expect("get").expect("state");
    assert!(state
        .task_queue
        .iter()
        .all(|t| t.status == TaskStatus::Pending));
}

// ── Sequence invariants ───────────────────────────────────────

#[test]
fn move_task_relocates_and_sets_status() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");

    let state = manager
        .move_task("1", TaskList::Queue, TaskList::Failed)
        .expect("move");
    assert!(state.task_queue.is_empty());
    assert_eq!(state.failed_tasks.len(), 1);
    assert_eq!(state.failed_tasks[0].status, TaskStatus::Failed);
}

#[test]
fn move_of_missing_task_leaves_state_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");
    let before = manager.get_state().expect("get");
    let on_disk = fs::read_to_string(manager.state_path()).expect("read");

    let err = manager
        .move_task("9", TaskList::Queue, TaskList::Completed)
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(ref m) if m.contains("task 9")));
    assert_eq!(manager.get_state().expect("get"), before);
    assert_eq!(fs::read_to_string(manager.state_path()).expect("read"), on_disk);
}

#[test]
fn terminal_task_cannot_move_back_to_queue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");
    manager
        .move_task("1", TaskList::Queue, TaskList::Completed)
        .expect("complete");

    let err = manager
        .move_task("1", TaskList::Completed, TaskList::Queue)
        .expect_err("reopen");
    assert!(matches!(err, AppError::StateTransition { .. }));
}

#[test]
fn update_that_duplicates_a_task_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");

    let err = manager
        .update_state(StateUpdate {
            completed_tasks: Some(vec![task("1", "code", &[])]),
            ..StateUpdate::default()
        })
        .expect_err("duplicate");
    match err {
        AppError::StateCorruption { reason, .. } => assert!(reason.contains("more than one")),
        other => panic!("expected StateCorruption, got {other:?}"),
    }
    let state = manager.get_state().expect("get").expect("state");
    assert!(state.completed_tasks.is_empty());
}

#[test]
fn update_that_drops_a_task_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");

    let err = manager
        .update_state(StateUpdate {
            task_queue: Some(Vec::new()),
            ..StateUpdate::default()
        })
        .expect_err("drop");
    assert!(matches!(err, AppError::StateCorruption { ref reason, .. } if reason.contains("drop")));
}

#[test]
fn update_task_edits_in_place() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");

    let state = manager
        .update_task(
            "1",
            &TaskUpdate {
                title: Some("renamed".into()),
                status: Some(TaskStatus::Running),
                ..TaskUpdate::default()
            },
        )
        .expect("update");
    assert_eq!(state.task_queue[0].title, "renamed");
    assert_eq!(state.task_queue[0].status, TaskStatus::Running);
    assert_eq!(state.task_queue[0].id, "1");
}

/// Deterministic xorshift so the mutation sequence is reproducible.
struct Rng(u64);

impl Rng {
    fn below(&mut self, n: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        usize::try_from(self.0 % n as u64).expect("fits")
    }
}

#[test]
fn sequences_stay_disjoint_across_mixed_mutations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
    let mut expected: HashSet<String> = HashSet::new();

    for step in 0..200 {
        let before = manager.get_state().expect("get").expect("state");
        let outcome = match rng.below(4) {
            0 => {
                let count = rng.below(3) + 1;
                let ids: Vec<String> = (0..count).map(|_| rng.below(12).to_string()).collect();
                let tasks: Vec<_> = ids.iter().map(|id| task(id, "code", &[])).collect();
                manager.enqueue_tasks(&tasks).map(|_| {
                    expected.extend(ids);
                })
            }
            1 => {
                let from = TaskList::ALL[rng.below(4)];
                let to = TaskList::ALL[rng.below(4)];
                let id = rng.below(12).to_string();
                manager.move_task(&id, from, to).map(|_| ())
            }
            2 => {
                // Copy a tracked task into another sequence.
                let Some(victim) = before.task_queue.first().cloned() else {
                    continue;
                };
                let mut blocked = before.blocked_tasks.clone();
                blocked.push(victim);
                manager
                    .update_state(StateUpdate {
                        blocked_tasks: Some(blocked),
                        ..StateUpdate::default()
                    })
                    .map(|_| ())
            }
            _ => {
                // Drop the last completed task.
                let mut completed = before.completed_tasks.clone();
                if completed.pop().is_none() {
                    continue;
                }
                manager
                    .update_state(StateUpdate {
                        completed_tasks: Some(completed),
                        ..StateUpdate::default()
                    })
                    .map(|_| ())
            }
        };

        let after = manager.get_state().expect("get").expect("state");
        assert_eq!(after.duplicate_task_id(), None, "step {step}");
        assert_eq!(after.tracked_ids(), expected, "step {step}");
        assert_eq!(after.task_count(), expected.len(), "step {step}");
        if outcome.is_err() {
            assert_eq!(after, before, "failed step {step} mutated state");
        }
    }

    let reloaded = AgentStateManager::new(manager.state_path())
        .load_state()
        .expect("load")
        .expect("state");
    assert_eq!(Some(reloaded), manager.get_state().expect("get"));
}

// ── Corruption ────────────────────────────────────────────────

#[test]
fn unparseable_file_is_corruption() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("state.json");
    fs::write(&path, "{ truncated").expect("write");

    let err = AgentStateManager::new(&path).load_state().expect_err("corrupt");
    assert!(matches!(err, AppError::StateCorruption { path: ref p, .. } if *p == path));
}

#[test]
fn missing_required_field_is_corruption() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    let raw = fs::read_to_string(manager.state_path()).expect("read");
    let mut value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    value
        .as_object_mut()
        .expect("object")
        .remove("completed_tasks");
    fs::write(manager.state_path(), value.to_string()).expect("write");

    let err = AgentStateManager::new(manager.state_path())
        .load_state()
        .expect_err("missing field");
    assert!(
        matches!(err, AppError::StateCorruption { ref reason, .. } if reason.contains("completed_tasks"))
    );
}

#[test]
fn duplicated_task_on_disk_is_corruption() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.enqueue_tasks(&[task("1", "code", &[])]).expect("enqueue");
    let raw = fs::read_to_string(manager.state_path()).expect("read");
    let mut value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let queued = value["task_queue"].clone();
    value["failed_tasks"] = queued;
    fs::write(manager.state_path(), value.to_string()).expect("write");

    let err = AgentStateManager::new(manager.state_path())
        .load_state()
        .expect_err("duplicate");
    assert!(matches!(err, AppError::StateCorruption { .. }));
}

// ── Recovery and metrics ──────────────────────────────────────

#[test]
fn interrupted_tasks_return_to_pending() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager
        .enqueue_tasks(&[task("1", "code", &[]), task("2", "code", &[])])
        .expect("enqueue");
    manager
        .update_task("1", &TaskUpdate::status(TaskStatus::Running))
        .expect("running");

    let reopened = AgentStateManager::new(manager.state_path());
    reopened.load_state().expect("load");
    assert_eq!(reopened.recover_interrupted().expect("recover"), vec!["1".to_owned()]);
    let state = reopened.get_state().expect("get").expect("state");
    assert!(state.task_queue.iter().all(|t| t.status == TaskStatus::Pending));
    assert!(reopened.recover_interrupted().expect("again").is_empty());
}

#[test]
fn executions_fold_into_metrics() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());

    manager.record_execution(record("1", true, &["a.rs", "b.rs"])).expect("one");
    manager.record_execution(record("2", true, &[])).expect("two");
    let state = manager.record_execution(record("3", false, &["c.rs"])).expect("three");

    assert_eq!(state.metrics.tasks_completed, 2);
    assert_eq!(state.metrics.tasks_failed, 1);
    assert_eq!(state.metrics.total_execution_ms, 120);
    assert_eq!(state.metrics.files_modified, 3);
    assert!((state.metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(state.execution_history.len(), 3);
    assert_eq!(state.execution_history[2].task_id, "3");
}

#[test]
fn mode_changes_are_logged_once_per_change() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.record_mode_transition(AgentMode::Running).expect("run");
    manager.record_mode_transition(AgentMode::Running).expect("repeat");
    let state = manager.record_mode_transition(AgentMode::Idle).expect("idle");

    assert_eq!(state.current_mode, AgentMode::Idle);
    let transitions: Vec<(AgentMode, AgentMode)> = state
        .timestamps
        .mode_transitions
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (AgentMode::Idle, AgentMode::Running),
            (AgentMode::Running, AgentMode::Idle)
        ]
    );
}

#[test]
fn peak_memory_only_rises() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.record_peak_memory(300).expect("raise");
    let state = manager.record_peak_memory(120).expect("lower");
    assert_eq!(state.metrics.peak_memory_mb, 300);
}

#[test]
fn clear_state_removes_file_and_memory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    manager.clear_state().expect("clear");
    assert!(!manager.state_path().exists());
    assert!(manager.get_state().expect("get").is_none());
    manager.clear_state().expect("clear twice");
}

#[test]
fn config_update_replaces_recorded_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    let mut config = agent_config(temp.path(), ResourceLimits::default());
    config.goal = "new goal".into();

    let state = manager
        .update_state(StateUpdate {
            config: Some(config),
            ..StateUpdate::default()
        })
        .expect("update");
    assert_eq!(state.config.goal, "new goal");
}

// ── Autosave ──────────────────────────────────────────────────

#[tokio::test]
async fn autosave_refreshes_last_save() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = state_manager(temp.path(), ResourceLimits::default());
    let before = manager
        .get_state()
        .expect("get")
        .expect("state")
        .timestamps
        .last_save;

    manager.start_auto_save(Duration::from_millis(20));
    manager.start_auto_save(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.stop_auto_save();

    let after = manager
        .get_state()
        .expect("get")
        .expect("state")
        .timestamps
        .last_save;
    assert!(after > before);

    let on_disk = AgentStateManager::new(manager.state_path())
        .load_state()
        .expect("load")
        .expect("state");
    assert_eq!(on_disk.timestamps.last_save, after);
}
