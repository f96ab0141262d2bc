//! End-to-end workflow tests.
//!
//! Submit a task set, run it to completion and check what the status
//! interface reports for every task.

use std::time::{Duration, Instant};

use serde_json::json;

use dagrun::core::{RunState, TaskId, TaskSpec, TaskStatus};
use dagrun::orchestration::{SchedulerEvent, TaskCondition};
use dagrun::Error;

use crate::fixtures::{drain, Harness};

/// Test: A failure blocks its dependents and nothing else
/// Given A fails, B depends on A and C is independent
/// When the run executes
/// Then C succeeds, A is failed and B stays pending blocked by A
#[tokio::test]
async fn test_failed_task_blocks_only_dependents() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("A", json!("echo broken >&2; exit 1")),
            TaskSpec::new("B", json!("echo b")).depends_on("A"),
            TaskSpec::new("C", json!("echo c")),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.counts.succeeded, 1);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.counts.pending, 1);

    let status = orch.status(&submission.run_id).await.unwrap();
    assert_eq!(status.task("C").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(status.task("B").unwrap().status, TaskStatus::Pending);
    assert_eq!(
        status.task("B").unwrap().condition,
        TaskCondition::BlockedByFailedDependency {
            dependency: TaskId::new("A")
        }
    );
    match &status.task("A").unwrap().condition {
        TaskCondition::Failed { error } => assert!(error.contains("broken"), "error: {}", error),
        other => panic!("expected failed condition, got {:?}", other),
    }
    assert_eq!(report.aggregation.merged["C"], json!("c"));
}

/// Test: Layers never overlap
/// Given a chain A -> B -> C
/// When the run executes with an event listener
/// Then every layer finishes before the next one starts
#[tokio::test]
async fn test_layers_run_strictly_in_order() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("A", json!("sleep 0.1; echo a")),
            TaskSpec::new("B", json!("echo b")).depends_on("A"),
            TaskSpec::new("C", json!("echo c")).depends_on("B"),
        ])
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = orch.run_with_events(submission.run_id, tx).await.unwrap();
    assert_eq!(report.counts.succeeded, 3);

    let events = drain(&mut rx);
    let layer_events: Vec<(bool, usize)> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::LayerStarted { layer, .. } => Some((true, *layer)),
            SchedulerEvent::LayerFinished { layer, .. } => Some((false, *layer)),
            _ => None,
        })
        .collect();
    assert_eq!(
        layer_events,
        vec![(true, 0), (false, 0), (true, 1), (false, 1), (true, 2), (false, 2)]
    );
    assert!(matches!(
        events.last(),
        Some(SchedulerEvent::RunFinished {
            state: RunState::Completed
        })
    ));
}

/// Test: A timed-out task keeps its context and blocks dependents
/// Given D sleeps far past the timeout and E depends on D
/// When the run executes
/// Then D is timed out, E stays pending and D's namespace is retained
#[tokio::test]
async fn test_timeout_retains_context_and_blocks_dependents() {
    let h = Harness::with_config(|c| c.task_timeout_secs = 1);
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("D", json!("echo partial > progress.txt; sleep 30")),
            TaskSpec::new("E", json!("echo e")).depends_on("D"),
        ])
        .await
        .unwrap();

    let started = Instant::now();
    let report = orch.run(submission.run_id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.counts.timed_out, 1);
    assert_eq!(report.counts.pending, 1);

    let status = orch.status(&submission.run_id).await.unwrap();
    assert_eq!(status.task("D").unwrap().condition, TaskCondition::TimedOut);
    assert_eq!(
        status.task("E").unwrap().condition,
        TaskCondition::BlockedByFailedDependency {
            dependency: TaskId::new("D")
        }
    );

    let retained = orch.isolation().retained();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].task_id, TaskId::new("D"));
    let progress = std::fs::read_to_string(retained[0].namespace.join("progress.txt")).unwrap();
    assert_eq!(progress.trim(), "partial");
}

/// Test: Cycles are reported and excluded
/// Given a valid task, a two-task cycle and a task with an unknown dependency
/// When submitted and run
/// Then only the valid task runs and the rest report why they are blocked
#[tokio::test]
async fn test_cycles_and_missing_dependencies_are_excluded() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("ok", json!("echo ok")),
            TaskSpec::new("x", json!("echo x")).depends_on("y"),
            TaskSpec::new("y", json!("echo y")).depends_on("x"),
            TaskSpec::new("z", json!("echo z")).depends_on("ghost"),
        ])
        .await
        .unwrap();
    assert_eq!(
        submission.cycles,
        vec![vec![TaskId::new("x"), TaskId::new("y")]]
    );

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.counts.succeeded, 1);

    let status = orch.status(&submission.run_id).await.unwrap();
    assert_eq!(status.task("x").unwrap().condition, TaskCondition::BlockedByCycle);
    assert_eq!(status.task("y").unwrap().condition, TaskCondition::BlockedByCycle);
    assert_eq!(
        status.task("z").unwrap().condition,
        TaskCondition::MissingDependency {
            dependency: TaskId::new("ghost")
        }
    );
}

/// Test: A fully cyclic submission is rejected
#[tokio::test]
async fn test_fully_cyclic_submission_is_rejected() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .submit(vec![
            TaskSpec::new("a", json!("true")).depends_on("c"),
            TaskSpec::new("b", json!("true")).depends_on("a"),
            TaskSpec::new("c", json!("true")).depends_on("b"),
        ])
        .await;
    match result {
        Err(Error::CycleDetected { members }) => assert_eq!(members.len(), 3),
        other => panic!("expected CycleDetected, got {:?}", other),
    }
}

/// Test: Cancelling a run stops in-flight work without undoing finished work
/// Given A finishes quickly and B sleeps
/// When the run is cancelled while B is running
/// Then A stays succeeded, B is cancelled and the run cannot be restarted
#[tokio::test]
async fn test_cancel_is_forward_only() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("A", json!("echo a")),
            TaskSpec::new("B", json!("sleep 30")).depends_on("A"),
        ])
        .await
        .unwrap();
    let run_id = submission.run_id;

    let started = Instant::now();
    let (report, cancelled) = tokio::join!(orch.run(run_id), async {
        loop {
            let status = orch.status(&run_id).await.unwrap();
            if status.task("B").unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        orch.cancel(&run_id).await
    });
    cancelled.unwrap();
    let report = report.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.state, RunState::Cancelled);

    let status = orch.status(&run_id).await.unwrap();
    assert_eq!(status.task("A").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(status.task("B").unwrap().condition, TaskCondition::Cancelled);
    assert!(orch.run(run_id).await.is_err());
}
