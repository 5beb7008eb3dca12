//! End-to-end orchestrator scenarios over the full stack: bus, bridges,
//! workflow engine and recovery against scripted terminal sessions.

use integration_tests::TestHarness;
use mocks::{pending_task, MockStateStore, WorkflowBuilder};
use orchestrator_core::{
    models::{ExecutionState, NewTask, StepState, TaskOrigin, TaskState},
    store::StateStore,
};
use std::sync::Arc;
use std::time::Duration;

/// A single echo task completes with its output captured
/// between the framing markers.
#[tokio::test]
async fn single_echo_task_round_trip() {
    let h = TestHarness::start(&[("supervisor", "claude-supervisor")]).await;

    let task_id = h
        .bus
        .publish_task(NewTask::new("supervisor", "echo 'hello'"))
        .await
        .unwrap();

    let task = h.wait_task_terminal(&task_id).await;
    assert_eq!(task.state, TaskState::Completed);

    let result = task.result.unwrap();
    assert!(result.success);
    assert!(!result.has_errors);
    assert!(result.raw_output.contains("hello"));

    // the session saw the full framing
    let sent = h.session.sent_lines("claude-supervisor");
    assert!(sent.iter().any(|l| l.contains("TASK_START")));
    assert!(sent.iter().any(|l| l == "echo 'hello'"));
    assert!(sent.iter().any(|l| l.contains("TASK_END")));

    h.shutdown().await;
}

/// An error signature in the pane fails the task, and
/// `max_retries = 1` means no further attempts.
#[tokio::test]
async fn error_signature_fails_without_retry() {
    let h = TestHarness::start(&[("supervisor", "claude-supervisor")]).await;
    h.session.on_command(
        "this_does_not_exist",
        &["bash: this_does_not_exist: command not found"],
    );

    let task_id = h
        .bus
        .publish_task(NewTask::new("supervisor", "this_does_not_exist").with_max_retries(1))
        .await
        .unwrap();

    let task = h.wait_task_terminal(&task_id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.unwrap().contains("command not found"));

    // exactly one framed attempt hit the session
    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempts = h
        .session
        .sent_lines("claude-supervisor")
        .iter()
        .filter(|l| l.contains("TASK_START"))
        .count();
    assert_eq!(attempts, 1);

    h.shutdown().await;
}

/// A command that outlives its timeout fails with a timeout
/// error and a durable `failed` state.
#[tokio::test]
async fn timeout_fails_task_durably() {
    let h = TestHarness::start(&[("supervisor", "claude-supervisor")]).await;
    h.session.on_command_blocking("sleep 30");

    let task_id = h
        .bus
        .publish_task(
            NewTask::new("supervisor", "sleep 30")
                .with_timeout_secs(2)
                .with_max_retries(1),
        )
        .await
        .unwrap();

    let task = h.wait_task_terminal(&task_id).await;
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.unwrap().starts_with("timeout"));

    h.shutdown().await;
}

/// A two-step sequential workflow completes, and the dependent
/// step's task starts only after the first step's task completed.
#[tokio::test]
async fn sequential_workflow_orders_steps() {
    let h = TestHarness::start(&[
        ("supervisor", "claude-supervisor"),
        ("worker", "claude-worker"),
    ])
    .await;

    let workflow_id = h
        .engine
        .define_workflow(
            WorkflowBuilder::new("two-step")
                .step("s1", "supervisor", "echo 'one'")
                .step_after("s2", "worker", "echo 'two'", &["s1"])
                .build(),
        )
        .await
        .unwrap();
    let execution_id = h
        .engine
        .execute(&workflow_id, serde_json::Map::new())
        .await
        .unwrap();

    let execution = h.wait_execution_terminal(&execution_id).await;
    assert_eq!(execution.status, ExecutionState::Completed);
    assert_eq!(execution.steps["s1"].state, StepState::Completed);
    assert_eq!(execution.steps["s2"].state, StepState::Completed);

    // s2's task was created after s1's task completed
    let s1_task = h
        .store
        .get_task(execution.steps["s1"].task_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let s2_task = h
        .store
        .get_task(execution.steps["s2"].task_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(s2_task.created >= s1_task.completed.unwrap());

    h.shutdown().await;
}

/// A diamond workflow fans out: both parallel branches run simultaneously,
/// and the join starts only after both complete.
#[tokio::test]
async fn parallel_fan_out_and_join() {
    let h = TestHarness::start(&[
        ("supervisor", "claude-supervisor"),
        ("backend", "claude-backend"),
        ("database", "claude-database"),
    ])
    .await;
    // keep the branches busy long enough to observe the overlap
    h.session.on_command_slow("work p1", &["p1 done"], 5);
    h.session.on_command_slow("work p2", &["p2 done"], 5);

    let workflow_id = h
        .engine
        .define_workflow(
            WorkflowBuilder::new("diamond")
                .step("init", "supervisor", "echo 'init'")
                .step_after("p1", "backend", "work p1", &["init"])
                .step_after("p2", "database", "work p2", &["init"])
                .step_after("join", "supervisor", "echo 'join'", &["p1", "p2"])
                .build(),
        )
        .await
        .unwrap();
    let execution_id = h
        .engine
        .execute(&workflow_id, serde_json::Map::new())
        .await
        .unwrap();

    // both branches observably running at once
    h.wait_execution(&execution_id, |e| {
        e.steps["p1"].state == StepState::Running && e.steps["p2"].state == StepState::Running
    })
    .await;

    let execution = h.wait_execution_terminal(&execution_id).await;
    assert_eq!(execution.status, ExecutionState::Completed);

    // join dispatched only after both branches completed
    let join_task = h
        .store
        .get_task(execution.steps["join"].task_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    for branch in ["p1", "p2"] {
        let branch_task = h
            .store
            .get_task(execution.steps[branch].task_id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(join_task.created >= branch_task.completed.unwrap());
    }

    h.shutdown().await;
}

/// A stale pending task seeded into the store is re-queued on
/// startup recovery as a fresh task carrying `original_task_id`, runs to
/// completion, and the original is marked `retried`.
#[tokio::test]
async fn recovery_requeues_stale_pending_task() {
    let store = Arc::new(MockStateStore::new());
    let mut stale = pending_task("t-stale", "supervisor", "echo 'revived'");
    stale.created = chrono::Utc::now() - chrono::Duration::seconds(400);
    store.save_task(&stale).await.unwrap();

    // TestHarness::start runs the same recovery pass the daemon runs
    let h = TestHarness::start_with_store(&[("supervisor", "claude-supervisor")], store).await;

    let original = h.wait_task_terminal("t-stale").await;
    assert_eq!(original.state, TaskState::Retried);

    // find the successor carrying the original id
    let successor_id = h
        .store
        .all_tasks()
        .into_iter()
        .find(|t| {
            matches!(
                &t.origin,
                Some(TaskOrigin::Recovery { original_task_id }) if original_task_id == "t-stale"
            )
        })
        .expect("successor task exists")
        .id;

    let successor = h.wait_task_terminal(&successor_id).await;
    assert_eq!(successor.state, TaskState::Completed);
    assert_ne!(successor.id, "t-stale");
    assert!(successor.result.unwrap().raw_output.contains("revived"));

    h.shutdown().await;
}

/// Idempotence law: publishing a result for an already-terminal task id is
/// a no-op.
#[tokio::test]
async fn terminal_result_publication_is_idempotent() {
    let h = TestHarness::start(&[("supervisor", "claude-supervisor")]).await;

    let task_id = h
        .bus
        .publish_task(NewTask::new("supervisor", "echo 'first'"))
        .await
        .unwrap();
    let task = h.wait_task_terminal(&task_id).await;
    assert_eq!(task.state, TaskState::Completed);
    let original_output = task.result.unwrap().raw_output;

    // a late duplicate failure publication changes nothing durable
    let late = orchestrator_core::models::TaskResult::failure("late noise");
    h.bus
        .publish_result(&task_id, &late, Some("late noise"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.result.unwrap().raw_output, original_output);

    h.shutdown().await;
}

/// A task addressed to an offline agent stays pending until recovery or a
/// bridge picks it up.
#[tokio::test]
async fn task_for_offline_agent_sits_pending() {
    let h = TestHarness::start(&[("supervisor", "claude-supervisor")]).await;

    let task_id = h
        .bus
        .publish_task(NewTask::new("offline-agent", "echo 'later'"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let task = h.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);

    h.shutdown().await;
}

/// Step timeouts flow from the workflow definition into the emitted task.
#[tokio::test]
async fn step_timeout_reaches_the_task() {
    let h = TestHarness::start(&[("supervisor", "claude-supervisor")]).await;
    h.session.on_command_blocking("slow job");

    let workflow_id = h
        .engine
        .define_workflow(
            WorkflowBuilder::new("impatient")
                .step("only", "supervisor", "slow job")
                .with_step_timeout(1)
                .with_step_retries(1)
                .build(),
        )
        .await
        .unwrap();
    let execution_id = h
        .engine
        .execute(&workflow_id, serde_json::Map::new())
        .await
        .unwrap();

    let execution = h.wait_execution_terminal(&execution_id).await;
    assert_eq!(execution.status, ExecutionState::Failed);
    assert_eq!(execution.steps["only"].state, StepState::Failed);

    h.shutdown().await;
}
