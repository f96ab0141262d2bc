//! Output conflict and validation tests.
//!
//! Tasks of one layer that claim the same output key are resolved by the
//! configured policy or by an adjudicating validator. Unresolved conflicts
//! and failed validation halt the run.

use std::sync::Arc;

use serde_json::json;

use dagrun::core::{RunState, TaskId, TaskSpec, TaskStatus};
use dagrun::orchestration::aggregator::Resolution;
use dagrun::orchestration::{ConflictPolicy, TaskCondition};
use dagrun::Error;

use crate::fixtures::{Harness, ScriptedValidator};

fn claim(key: &str, value: &str) -> serde_json::Value {
    json!(format!(r#"echo '{{"{}": "{}"}}'"#, key, value))
}

/// Test: Default policy keeps the lowest task id's value
#[tokio::test]
async fn test_lowest_id_wins_by_default() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("b", claim("shared", "from-b")),
            TaskSpec::new("a", claim("shared", "from-a")),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.aggregation.merged["shared"], json!("from-a"));

    let conflict = &report.aggregation.conflicts[0];
    assert_eq!(conflict.key, "shared");
    assert_eq!(conflict.winner, Some(TaskId::new("a")));
    assert_eq!(conflict.resolution, Resolution::Policy);
    assert_eq!(conflict.claims.len(), 2);
    assert_eq!(conflict.claims[1].value, json!("from-b"));
}

/// Test: Later layers override earlier keys without a conflict
#[tokio::test]
async fn test_later_layer_overrides_key() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("first", claim("version", "1")),
            TaskSpec::new("second", claim("version", "2")).depends_on("first"),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.aggregation.merged["version"], json!("2"));
    assert!(report.aggregation.conflicts.is_empty());
}

/// Test: An unresolved conflict halts the run
/// Given the reject policy and two tasks claiming one key
/// When the layer aggregates
/// Then the run halts, both contexts are retained and dependents are blocked
#[tokio::test]
async fn test_rejected_conflict_halts_run() {
    let h = Harness::with_config(|c| c.conflict_policy = ConflictPolicy::Reject);
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("a", claim("shared", "1")),
            TaskSpec::new("b", claim("shared", "2")),
            TaskSpec::new("c", json!("echo c")).depends_on("a"),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert!(matches!(report.state, RunState::Halted { layer: 0, .. }));
    assert_eq!(orch.isolation().retained().len(), 2);

    let status = orch.status(&submission.run_id).await.unwrap();
    assert_eq!(
        status.task("c").unwrap().condition,
        TaskCondition::BlockedByValidation { layer: 0 }
    );
    assert!(matches!(
        orch.run(submission.run_id).await,
        Err(Error::ConflictUnresolved { layer: 0, .. })
    ));
}

/// Test: An adjudicating validator picks the winner
#[tokio::test]
async fn test_validator_adjudicates_conflict() {
    let validator = Arc::new(ScriptedValidator::adjudicating("b"));
    let h = Harness::with_config(|c| c.conflict_policy = ConflictPolicy::Reject)
        .with_validator(validator.clone());
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("a", claim("shared", "from-a")),
            TaskSpec::new("b", claim("shared", "from-b")),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.aggregation.merged["shared"], json!("from-b"));
    assert_eq!(report.aggregation.conflicts[0].resolution, Resolution::Adjudicated);
    assert_eq!(validator.layers_seen(), vec![0]);
}

/// Test: Confidence below the threshold fails validation
#[tokio::test]
async fn test_low_confidence_halts_run() {
    let validator = Arc::new(ScriptedValidator::passing(0.4));
    let h = Harness::new().with_validator(validator.clone());
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("a", json!("echo a")),
            TaskSpec::new("b", json!("echo b")).depends_on("a"),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    match &report.state {
        RunState::Halted { layer, reason } => {
            assert_eq!(*layer, 0);
            assert!(reason.contains("confidence"), "reason: {}", reason);
        }
        other => panic!("expected halted run, got {:?}", other),
    }
    assert_eq!(validator.layers_seen(), vec![0]);

    let status = orch.status(&submission.run_id).await.unwrap();
    assert_eq!(status.task("b").unwrap().status, TaskStatus::Pending);
}

/// Test: Resetting a task of the halted layer resumes the run
/// Given a rejected conflict caused by task b
/// When b is fixed, reset and the run started again
/// Then the layer merges and the dependent runs
#[tokio::test]
async fn test_reset_after_halt_resumes_run() {
    let h = Harness::with_config(|c| c.conflict_policy = ConflictPolicy::Reject);
    let orch = &h.orchestrator;
    let fixed = h.scratch("fixed");
    let script = format!(
        r#"if test -f {}; then echo '{{"other": "b"}}'; else echo '{{"shared": "b"}}'; fi"#,
        fixed.display()
    );
    let submission = orch
        .submit(vec![
            TaskSpec::new("a", claim("shared", "a")),
            TaskSpec::new("b", json!(script)),
            TaskSpec::new("c", json!("echo c")).depends_on("a"),
        ])
        .await
        .unwrap();
    let run_id = submission.run_id;

    let report = orch.run(run_id).await.unwrap();
    assert!(matches!(report.state, RunState::Halted { .. }));

    std::fs::write(&fixed, "").unwrap();
    orch.reset_task(&run_id, &TaskId::new("b")).await.unwrap();
    assert_eq!(orch.status(&run_id).await.unwrap().state, RunState::Pending);

    let report = orch.run(run_id).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.counts.succeeded, 3);
    assert_eq!(report.aggregation.merged["shared"], json!("a"));
    assert_eq!(report.aggregation.merged["other"], json!("b"));
    assert!(report.aggregation.conflicts.is_empty());
}

/// Test: A re-run reports each layer's conflicts once
/// Given a layer with a policy-resolved conflict and a failing task
/// When the failing task is fixed, reset and the run started again
/// Then the report lists the conflict once
#[tokio::test]
async fn test_rerun_does_not_duplicate_conflicts() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let fixed = h.scratch("fixed");
    let submission = orch
        .submit(vec![
            TaskSpec::new("a", claim("shared", "from-a")),
            TaskSpec::new("b", claim("shared", "from-b")),
            TaskSpec::new("flaky", json!(format!("test -f {}", fixed.display()))),
            TaskSpec::new("after", json!("echo after")).depends_on("flaky"),
        ])
        .await
        .unwrap();
    let run_id = submission.run_id;

    let report = orch.run(run_id).await.unwrap();
    assert_eq!(report.aggregation.conflicts.len(), 1);
    assert_eq!(report.counts.failed, 1);

    std::fs::write(&fixed, "").unwrap();
    orch.reset_task(&run_id, &TaskId::new("flaky")).await.unwrap();
    let report = orch.run(run_id).await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.counts.succeeded, 4);
    assert_eq!(report.aggregation.conflicts.len(), 1);
    assert_eq!(report.aggregation.merged["shared"], json!("from-a"));
    assert_eq!(report.aggregation.merged["after"], json!("after"));
}
