//! Integration tests for the discover, plan, execute cycle.
//!
//! Drives the loop with scripted discovery and closure workflows against a
//! real state file, then inspects where each task ended up.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use agent_autopilot::collaborators::backoff::Backoff;
use agent_autopilot::collaborators::inbox::InboxDiscovery;
use agent_autopilot::collaborators::planner::DependencyPlanner;
use agent_autopilot::collaborators::Discovery;
use agent_autopilot::models::plan::Plan;
use agent_autopilot::models::state::{AgentMode, ResourceLimits};
use agent_autopilot::models::task::TaskStatus;
use agent_autopilot::orchestrator::{
    AgentStateManager, ContinuousImprovementLoop, TaskExecutor, WorkflowAdapter,
};
use agent_autopilot::AppError;

use super::test_helpers::{
    state_manager, task, ClosureWorkflow, FailingDiscovery, ScriptedDiscovery,
};

/// Adapter where `code` succeeds touching one file and `fix` always fails.
fn adapter() -> Arc<WorkflowAdapter> {
    let mut adapter = WorkflowAdapter::default();
    adapter.register(
        "code",
        ClosureWorkflow::new(|ctx| {
            Ok(json!({ "success": true, "files_modified": [format!("{}.rs", ctx.task_id)] }))
        }),
    );
    adapter.register(
        "fix",
        ClosureWorkflow::new(|_| Ok(json!({ "success": false, "error": "could not reproduce" }))),
    );
    Arc::new(adapter)
}

fn improvement_loop(
    discovery: Arc<dyn Discovery>,
    state: &Arc<AgentStateManager>,
) -> ContinuousImprovementLoop {
    ContinuousImprovementLoop::new(
        discovery,
        Arc::new(DependencyPlanner),
        Arc::new(TaskExecutor::new(adapter())),
        Arc::clone(state),
    )
}

// ── Single iterations ─────────────────────────────────────────

#[tokio::test]
async fn empty_discovery_lengthens_backoff() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let discovery = ScriptedDiscovery::new(Vec::new());
    let cycle = improvement_loop(discovery.clone(), &state);

    let report = cycle.iteration().await.expect("iteration");
    assert_eq!(report.discovered, 0);
    assert!(report.execution.is_none());
    assert_eq!(discovery.increases.load(Ordering::SeqCst), 1);
    assert_eq!(discovery.resets.load(Ordering::SeqCst), 0);

    let snapshot = state.get_state().expect("get").expect("state");
    assert_eq!(snapshot.session.iteration, 1);
    assert_eq!(cycle.iteration_count(), 1);
}

#[tokio::test]
async fn failed_discovery_counts_as_no_work() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let cycle = improvement_loop(Arc::new(FailingDiscovery), &state);

    let report = cycle.iteration().await.expect("iteration");
    assert_eq!(report.discovered, 0);
    assert!(report.execution.is_none());
}

#[tokio::test]
async fn discovered_task_runs_to_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let discovery = ScriptedDiscovery::new(vec![vec![task("1", "code", &[])]]);
    let cycle = improvement_loop(discovery.clone(), &state);

    let report = cycle.iteration().await.expect("iteration");
    let summary = report.execution.expect("plan executed");
    assert_eq!(summary.completed, vec!["1".to_owned()]);
    assert!(!summary.interrupted);
    assert_eq!(discovery.resets.load(Ordering::SeqCst), 1);

    let snapshot = state.get_state().expect("get").expect("state");
    assert!(snapshot.task_queue.is_empty());
    assert_eq!(snapshot.completed_tasks.len(), 1);
    assert_eq!(snapshot.completed_tasks[0].status, TaskStatus::Completed);
    assert_eq!(snapshot.metrics.tasks_completed, 1);
    assert_eq!(snapshot.metrics.files_modified, 1);
    assert_eq!(snapshot.execution_history.len(), 1);
    assert!(snapshot.execution_history[0].success);
}

#[tokio::test]
async fn cyclic_tasks_are_not_executed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let discovery = ScriptedDiscovery::new(vec![vec![
        task("1", "code", &["2"]),
        task("2", "code", &["1"]),
    ]]);
    let cycle = improvement_loop(discovery.clone(), &state);

    let report = cycle.iteration().await.expect("iteration");
    assert_eq!(report.discovered, 2);
    assert!(report.execution.is_none());
    assert_eq!(discovery.increases.load(Ordering::SeqCst), 1);
    let snapshot = state.get_state().expect("get").expect("state");
    assert_eq!(snapshot.task_count(), 0);
}

#[tokio::test]
async fn corrected_inbox_file_is_picked_up_after_a_planning_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let inbox_dir = temp.path().join("inbox");
    fs::create_dir_all(&inbox_dir).expect("inbox dir");
    let file = inbox_dir.join("tasks.json");
    fs::write(
        &file,
        r#"[{ "id": "1", "title": "one", "workflow": "code", "dependencies": ["2"] },
            { "id": "2", "title": "two", "workflow": "code", "dependencies": ["1"] }]"#,
    )
    .expect("write cyclic");
    let discovery = Arc::new(InboxDiscovery::new(inbox_dir, Backoff::new(0, 0, 2)));
    let cycle = improvement_loop(discovery, &state);

    let cyclic = cycle.iteration().await.expect("cyclic iteration");
    assert_eq!(cyclic.discovered, 2);
    assert!(cyclic.execution.is_none());

    fs::write(
        &file,
        r#"[{ "id": "1", "title": "one", "workflow": "code", "dependencies": ["2"] },
            { "id": "2", "title": "two", "workflow": "code" }]"#,
    )
    .expect("write fixed");
    let fixed = cycle.iteration().await.expect("fixed iteration");
    assert_eq!(fixed.discovered, 2);
    let summary = fixed.execution.expect("plan executed");
    assert_eq!(summary.completed, vec!["2".to_owned(), "1".to_owned()]);

    let after = cycle.iteration().await.expect("later iteration");
    assert_eq!(after.discovered, 0);
}

#[tokio::test]
async fn discovered_task_with_terminal_status_still_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let mut claimed_done = task("1", "code", &[]);
    claimed_done.status = TaskStatus::Completed;
    let cycle = improvement_loop(ScriptedDiscovery::new(vec![vec![claimed_done]]), &state);

    let summary = cycle
        .iteration()
        .await
        .expect("iteration")
        .execution
        .expect("plan executed");
    assert_eq!(summary.completed, vec!["1".to_owned()]);
    assert!(summary.skipped.is_empty());

    let snapshot = state.get_state().expect("get").expect("state");
    assert!(snapshot.task_queue.is_empty());
    assert_eq!(snapshot.completed_tasks.len(), 1);
    assert_eq!(snapshot.execution_history.len(), 1);
}

// ── Plan execution ────────────────────────────────────────────

#[tokio::test]
async fn failure_blocks_dependents_but_not_siblings() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let cycle = improvement_loop(ScriptedDiscovery::new(Vec::new()), &state);
    let plan = DependencyPlanner::plan(
        "goal",
        vec![
            task("1", "fix", &[]),
            task("2", "code", &[]),
            task("3", "code", &["1"]),
            task("4", "code", &["3"]),
        ],
    )
    .expect("plan");

    let summary = cycle.execute_plan(&plan).await.expect("execute");
    assert_eq!(summary.failed, vec!["1".to_owned()]);
    assert_eq!(summary.completed, vec!["2".to_owned()]);
    assert_eq!(summary.blocked, vec!["3".to_owned(), "4".to_owned()]);

    let snapshot = state.get_state().expect("get").expect("state");
    assert!(snapshot.task_queue.is_empty());
    assert_eq!(snapshot.failed_tasks[0].status, TaskStatus::Failed);
    assert!(snapshot
        .blocked_tasks
        .iter()
        .all(|t| t.status == TaskStatus::Blocked));
    assert_eq!(snapshot.metrics.tasks_failed, 1);
    assert!((snapshot.metrics.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(
        snapshot.execution_history[0].error.as_deref(),
        Some("could not reproduce")
    );
}

#[tokio::test]
async fn invalid_plan_is_rejected_before_enqueue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let cycle = improvement_loop(ScriptedDiscovery::new(Vec::new()), &state);
    let plan = Plan {
        goal: "goal".into(),
        tasks: vec![task("1", "code", &[])],
        execution_order: vec![vec!["1".into()], vec!["ghost".into()]],
        ..Plan::default()
    };

    let err = cycle.execute_plan(&plan).await.expect_err("invalid");
    assert!(matches!(err, AppError::InvalidPlan(_)));
    let snapshot = state.get_state().expect("get").expect("state");
    assert!(snapshot.task_queue.is_empty());
}

#[tokio::test]
async fn tasks_already_finished_are_skipped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let cycle = improvement_loop(ScriptedDiscovery::new(Vec::new()), &state);
    let plan = DependencyPlanner::plan("goal", vec![task("1", "code", &[])]).expect("plan");

    cycle.execute_plan(&plan).await.expect("first run");
    let again = cycle.execute_plan(&plan).await.expect("second run");
    assert_eq!(again.skipped, vec!["1".to_owned()]);
    assert!(again.completed.is_empty());
    let snapshot = state.get_state().expect("get").expect("state");
    assert_eq!(snapshot.execution_history.len(), 1);
}

#[tokio::test]
async fn files_limit_interrupts_the_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let limits = ResourceLimits {
        max_files_modified: Some(2),
        ..ResourceLimits::default()
    };
    let state = state_manager(temp.path(), limits);
    let cycle = improvement_loop(ScriptedDiscovery::new(Vec::new()), &state);
    let plan = DependencyPlanner::plan(
        "goal",
        vec![
            task("1", "code", &[]),
            task("2", "code", &[]),
            task("3", "code", &[]),
        ],
    )
    .expect("plan");

    let summary = cycle.execute_plan(&plan).await.expect("execute");
    assert!(summary.interrupted);
    assert_eq!(summary.completed.len(), 2);
    let snapshot = state.get_state().expect("get").expect("state");
    assert_eq!(snapshot.task_queue.len(), 1);
    assert_eq!(snapshot.task_queue[0].status, TaskStatus::Pending);
}

// ── Lifecycle ─────────────────────────────────────────────────

#[tokio::test]
async fn start_runs_until_stopped_and_rejects_reentry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let discovery = ScriptedDiscovery::new(vec![vec![task("1", "code", &[])]]);
    let cycle = Arc::new(improvement_loop(discovery.clone(), &state));

    let handle = {
        let cycle = Arc::clone(&cycle);
        tokio::spawn(async move { cycle.start().await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while discovery.calls.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "loop never iterated twice");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(cycle.is_running());
    assert_eq!(cycle.mode(), AgentMode::Running);
    assert!(matches!(
        cycle.start().await,
        Err(AppError::StateTransition { .. })
    ));

    cycle.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop stopped in time")
        .expect("join")
        .expect("loop result");

    assert!(!cycle.is_running());
    assert_eq!(cycle.mode(), AgentMode::Idle);
    let snapshot = state.get_state().expect("get").expect("state");
    assert_eq!(snapshot.current_mode, AgentMode::Idle);
    assert_eq!(snapshot.completed_tasks.len(), 1);
    let modes: Vec<AgentMode> = snapshot
        .timestamps
        .mode_transitions
        .iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        modes,
        vec![AgentMode::Running, AgentMode::Stopping, AgentMode::Idle]
    );
}

#[tokio::test]
async fn stop_before_execution_leaves_tasks_queued() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let cycle = improvement_loop(ScriptedDiscovery::new(Vec::new()), &state);
    let plan = DependencyPlanner::plan("goal", vec![task("1", "code", &[])]).expect("plan");

    cycle.stop();
    let summary = cycle.execute_plan(&plan).await.expect("execute");
    assert!(summary.interrupted);
    assert!(summary.completed.is_empty());
    let snapshot = state.get_state().expect("get").expect("state");
    assert_eq!(snapshot.task_queue.len(), 1);
}

#[tokio::test]
async fn stop_before_start_is_honoured_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let discovery = ScriptedDiscovery::new(Vec::new());
    let cycle = Arc::new(improvement_loop(discovery.clone(), &state));

    cycle.stop();
    tokio::time::timeout(Duration::from_secs(3), cycle.start())
        .await
        .expect("start returned after the earlier stop")
        .expect("loop result");
    assert_eq!(cycle.iteration_count(), 0);
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
    assert!(!cycle.is_running());

    let handle = {
        let cycle = Arc::clone(&cycle);
        tokio::spawn(async move { cycle.start().await })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while discovery.calls.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline, "restarted loop never iterated");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cycle.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop stopped in time")
        .expect("join")
        .expect("loop result");
}

#[tokio::test]
async fn persistence_failures_back_off_until_stopped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_manager(temp.path(), ResourceLimits::default());
    let discovery = ScriptedDiscovery::new(Vec::new());
    let cycle = Arc::new(improvement_loop(discovery.clone(), &state));

    fs::remove_file(state.state_path()).expect("remove state file");
    fs::create_dir(state.state_path()).expect("block state path");

    let handle = {
        let cycle = Arc::clone(&cycle);
        tokio::spawn(async move { cycle.start().await })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while discovery.increases.load(Ordering::SeqCst) < 3 {
        assert!(Instant::now() < deadline, "failed iterations were not backed off");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!handle.is_finished());
    assert!(cycle.is_running());
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);

    fs::remove_dir(state.state_path()).expect("unblock state path");
    while discovery.calls.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline, "loop did not recover once writable");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cycle.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop stopped in time")
        .expect("join")
        .expect("loop result");
    assert!(!cycle.is_running());
}
