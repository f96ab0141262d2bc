//! Remote offload tests against a mock invocation endpoint.

use mockito::{Matcher, Server};
use serde_json::json;

use dagrun::core::{TaskSpec, TaskStatus};
use dagrun::orchestration::{BackendHint, RemoteConfig, ScalingConfig, TaskCondition};

use crate::fixtures::Harness;

fn remote_harness(endpoint: String, scaling: ScalingConfig, agents: usize) -> Harness {
    Harness::with_config(move |c| {
        c.max_concurrent_agents = agents;
        c.scaling = scaling;
        c.remote = Some(RemoteConfig {
            endpoint,
            poll_interval_ms: 20,
            request_timeout_secs: 5,
            ..Default::default()
        });
    })
}

fn offload_heavy() -> ScalingConfig {
    ScalingConfig {
        remote_complexity_threshold: 5.0,
        ..Default::default()
    }
}

/// Test: Complex tasks are offloaded, simple ones stay local
#[tokio::test]
async fn test_complex_task_runs_remotely() {
    let mut server = Server::new_async().await;
    let submit = server
        .mock("POST", "/invocations")
        .match_body(Matcher::PartialJson(json!({"task_id": "heavy"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"inv-9","status":"succeeded","output":{"model":"trained"}}"#)
        .expect(1)
        .create_async()
        .await;

    let h = remote_harness(server.url(), offload_heavy(), 4);
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("heavy", json!({"op": "train"})).with_complexity(9.0),
            TaskSpec::new("light", json!("echo light")),
            TaskSpec::new("report", json!("echo done")).depends_on("heavy"),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    submit.assert_async().await;
    assert_eq!(report.counts.succeeded, 3);
    assert_eq!(report.aggregation.merged["model"], json!("trained"));

    let status = orch.status(&submission.run_id).await.unwrap();
    assert_eq!(status.task("heavy").unwrap().backend, Some(BackendHint::Remote));
    assert_eq!(status.task("light").unwrap().backend, Some(BackendHint::Local));
}

/// Test: A quota error fails the task like any other failure
#[tokio::test]
async fn test_remote_quota_fails_task() {
    let mut server = Server::new_async().await;
    let _submit = server
        .mock("POST", "/invocations")
        .with_status(429)
        .with_body("too many requests")
        .create_async()
        .await;

    let h = remote_harness(server.url(), offload_heavy(), 4);
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("heavy", json!("true")).with_complexity(9.0),
            TaskSpec::new("after", json!("true")).depends_on("heavy"),
        ])
        .await
        .unwrap();

    orch.run(submission.run_id).await.unwrap();
    let status = orch.status(&submission.run_id).await.unwrap();
    match &status.task("heavy").unwrap().condition {
        TaskCondition::Failed { error } => assert!(error.contains("429"), "error: {}", error),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(status.task("after").unwrap().status, TaskStatus::Pending);
}

/// Test: Repeated remote errors open the breaker and work returns local
/// Given one agent at a time and an endpoint that always errors
/// When four complex tasks run
/// Then two reach the endpoint and the rest run locally
#[tokio::test]
async fn test_breaker_routes_back_to_local() {
    let mut server = Server::new_async().await;
    let submit = server
        .mock("POST", "/invocations")
        .with_status(500)
        .with_body("internal error")
        .expect(2)
        .create_async()
        .await;

    let scaling = ScalingConfig {
        remote_complexity_threshold: 5.0,
        breaker_min_samples: 2,
        breaker_error_threshold: 0.5,
        ..Default::default()
    };
    let h = remote_harness(server.url(), scaling, 1);
    let orch = &h.orchestrator;
    let specs = (0..4)
        .map(|i| TaskSpec::new(format!("t{}", i), json!("echo local")).with_complexity(9.0))
        .collect();
    let submission = orch.submit(specs).await.unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    submit.assert_async().await;
    assert_eq!(report.counts.failed, 2);
    assert_eq!(report.counts.succeeded, 2);

    let status = orch.status(&submission.run_id).await.unwrap();
    let local = status
        .tasks
        .iter()
        .filter(|t| t.backend == Some(BackendHint::Local))
        .count();
    assert_eq!(local, 2);
}
