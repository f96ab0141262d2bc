//! Persistence tests.
//!
//! Status queries and cleanup keep working from stored manifests after the
//! orchestrator that ran a run is gone.

use serde_json::json;

use dagrun::core::{RunState, TaskId, TaskSpec, TaskStatus};
use dagrun::orchestration::{BackendHint, TaskCondition};
use dagrun::Error;

use crate::fixtures::Harness;

/// Test: Status survives a restart
/// Given a finished run with one failed branch
/// When a fresh orchestrator answers a status query
/// Then it reports the same per-task statuses and conditions
#[tokio::test]
async fn test_status_after_restart() {
    let h = Harness::new();
    let submission = h
        .orchestrator
        .submit(vec![
            TaskSpec::new("a", json!("exit 4")),
            TaskSpec::new("b", json!("echo b")).depends_on("a"),
            TaskSpec::new("c", json!("echo c")),
        ])
        .await
        .unwrap();
    h.orchestrator.run(submission.run_id).await.unwrap();
    let before = h.orchestrator.status(&submission.run_id).await.unwrap();

    let restarted = h.restart();
    assert_eq!(restarted.runs().unwrap(), vec![submission.run_id]);
    let after = restarted.status(&submission.run_id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.state, RunState::Completed);
    assert_eq!(after.task("c").unwrap().backend, Some(BackendHint::Local));
    assert_eq!(
        after.task("b").unwrap().condition,
        TaskCondition::BlockedByFailedDependency {
            dependency: TaskId::new("a")
        }
    );
    assert!((after.progress - 200.0 / 3.0).abs() < 1e-9);
}

/// Test: A submitted run can be executed by another orchestrator
#[tokio::test]
async fn test_run_submitted_before_restart() {
    let h = Harness::new();
    let submission = h
        .orchestrator
        .submit(vec![
            TaskSpec::new("a", json!("echo a")),
            TaskSpec::new("b", json!("echo b")).depends_on("a"),
        ])
        .await
        .unwrap();

    let restarted = h.restart();
    let pending = restarted.status(&submission.run_id).await.unwrap();
    assert_eq!(pending.state, RunState::Pending);
    assert_eq!(pending.progress, 0.0);
    assert_eq!(pending.task("a").unwrap().condition, TaskCondition::Ready);

    let report = restarted.run(submission.run_id).await.unwrap();
    assert_eq!(report.counts.succeeded, 2);
}

/// Test: Retained contexts can be cleaned up after a restart
#[tokio::test]
async fn test_cleanup_after_restart() {
    let h = Harness::new();
    let submission = h
        .orchestrator
        .submit(vec![TaskSpec::new("bad", json!("echo debris > debris.txt; exit 1"))])
        .await
        .unwrap();
    h.orchestrator.run(submission.run_id).await.unwrap();
    let retained = h.orchestrator.isolation().retained();
    assert_eq!(retained.len(), 1);
    assert!(retained[0].namespace.join("debris.txt").exists());

    let restarted = h.restart();
    assert!(restarted.isolation().retained().is_empty());
    assert_eq!(restarted.cleanup(&submission.run_id).await.unwrap(), 1);
    assert!(!retained[0].namespace.exists());

    let manifest = restarted.store().load(&submission.run_id).unwrap();
    assert!(manifest.retained_contexts.is_empty());
    assert!(matches!(
        manifest.task(&TaskId::new("bad")).unwrap().status,
        TaskStatus::Failed { .. }
    ));
}

/// Test: Unknown runs are reported as such
#[tokio::test]
async fn test_unknown_run() {
    let h = Harness::new();
    let id = dagrun::RunId::new();
    assert!(matches!(
        h.orchestrator.status(&id).await,
        Err(Error::RunNotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.run(id).await,
        Err(Error::RunNotFound(_))
    ));
}
