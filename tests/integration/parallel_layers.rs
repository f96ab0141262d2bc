//! Parallel execution tests.
//!
//! Tasks of one layer run concurrently, bounded by the agent limit, and
//! each one gets a namespace no other live context overlaps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use dagrun::core::{RunId, TaskId, TaskSpec};
use dagrun::orchestration::{IsolationConfig, IsolationContext, IsolationManager};
use dagrun::Error;

use crate::fixtures::{Harness, TestRepo};

fn assert_disjoint(contexts: &[IsolationContext]) {
    for (i, a) in contexts.iter().enumerate() {
        for b in &contexts[i + 1..] {
            assert!(
                !a.overlaps(&b.namespace),
                "{} overlaps {}",
                a.namespace.display(),
                b.namespace.display()
            );
            assert_ne!(a.branch, b.branch, "branch shared by {} and {}", a.task_id, b.task_id);
        }
    }
}

/// What happens to a context after its allocation round.
#[derive(Debug, Clone, Copy)]
enum Settle {
    Release,
    Retain,
    Keep,
}

fn settle() -> impl Strategy<Value = Settle> {
    prop_oneof![Just(Settle::Release), Just(Settle::Retain), Just(Settle::Keep)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Ids drawn from a tiny alphabet so many of them sanitize to the same
    /// name. Each round allocates every id from its own thread at once, then
    /// releases, retains or keeps each new context.
    #[test]
    fn prop_live_contexts_stay_disjoint(
        ids in proptest::collection::btree_set(r"[ab][./ -]?[ab]?", 1..8),
        rounds in proptest::collection::vec(proptest::collection::vec(settle(), 8), 1..4),
    ) {
        let dir = TempDir::new().unwrap();
        let owned = IsolationManager::new(IsolationConfig {
            max_active: 64,
            ..IsolationConfig::new(dir.path())
        })
        .unwrap();
        let manager = &owned;
        let run_id = RunId::new();
        let ids: Vec<TaskId> = ids.into_iter().map(TaskId::new).collect();
        let mut live: Vec<IsolationContext> = Vec::new();

        for plan in rounds {
            let results: Vec<_> = std::thread::scope(|scope| {
                let handles: Vec<_> = ids
                    .iter()
                    .map(|id| scope.spawn(move || manager.allocate(&run_id, id)))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            for (result, step) in results.into_iter().zip(plan.iter().cycle()) {
                let ctx = match result {
                    Ok(ctx) => ctx,
                    // The task still holds a context from an earlier round.
                    Err(Error::Validation(_)) => continue,
                    Err(other) => panic!("unexpected allocation error: {}", other),
                };
                match step {
                    Settle::Release => manager.release(&ctx).unwrap(),
                    Settle::Retain => {
                        manager.retain(&ctx);
                        live.push(ctx);
                    }
                    Settle::Keep => {
                        manager.mark_idle(&ctx);
                        live.push(ctx);
                    }
                }
            }

            assert_disjoint(&live);
            prop_assert_eq!(manager.live_count(), live.len());
            for ctx in &live {
                prop_assert!(ctx.namespace.is_dir());
            }
        }
    }
}

/// Test: The agent limit bounds a layer's parallelism
/// Given six independent tasks and at most two agents
/// When the layer runs
/// Then it takes at least three rounds of task duration
#[tokio::test]
async fn test_agent_limit_bounds_parallelism() {
    let h = Harness::with_config(|c| c.max_concurrent_agents = 2);
    let orch = &h.orchestrator;
    let specs = (0..6)
        .map(|i| TaskSpec::new(format!("t{}", i), json!("sleep 0.3")))
        .collect();
    let submission = orch.submit(specs).await.unwrap();

    let started = Instant::now();
    let report = orch.run(submission.run_id).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(850));
    assert_eq!(report.counts.succeeded, 6);
}

/// Test: Independent tasks overlap in time
#[tokio::test]
async fn test_independent_tasks_run_concurrently() {
    let h = Harness::with_config(|c| c.max_concurrent_agents = 8);
    let orch = &h.orchestrator;
    let specs = (0..4)
        .map(|i| TaskSpec::new(format!("t{}", i), json!("sleep 1")))
        .collect();
    let submission = orch.submit(specs).await.unwrap();

    let started = Instant::now();
    let report = orch.run(submission.run_id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.counts.succeeded, 4);
}

/// Test: Context backpressure delays tasks instead of failing them
#[tokio::test]
async fn test_context_backpressure_is_not_a_failure() {
    let h = Harness::with_config(|c| {
        c.max_concurrent_agents = 4;
        c.max_active_contexts = 1;
    });
    let orch = &h.orchestrator;
    let specs = (0..3)
        .map(|i| TaskSpec::new(format!("t{}", i), json!("sleep 0.1")))
        .collect();
    let submission = orch.submit(specs).await.unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.counts.succeeded, 3);
    assert_eq!(orch.isolation().live_count(), 0);
}

/// Test: Every task sees its own namespace
/// Given five parallel tasks reporting their working directory
/// When the layer merges
/// Then the directories are pairwise disjoint and released afterwards
#[tokio::test]
async fn test_tasks_run_in_disjoint_namespaces() {
    let h = Harness::new();
    let orch = &h.orchestrator;
    let script = r#"touch shared.txt; printf '{"ns_%s": "%s"}' "$DAGRUN_TASK_ID" "$PWD""#;
    let specs = (0..5)
        .map(|i| TaskSpec::new(format!("t{}", i), json!(script)))
        .collect();
    let submission = orch.submit(specs).await.unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.counts.succeeded, 5);
    assert!(report.aggregation.conflicts.is_empty());

    let dirs: Vec<std::path::PathBuf> = (0..5)
        .map(|i| {
            let value = &report.aggregation.merged[&format!("ns_t{}", i)];
            std::path::PathBuf::from(value.as_str().unwrap())
        })
        .collect();
    for (i, a) in dirs.iter().enumerate() {
        assert!(a.starts_with(h.dir.path().join("workspaces")));
        for b in &dirs[i + 1..] {
            assert!(!a.starts_with(b) && !b.starts_with(a));
        }
        assert!(!a.exists(), "merged context {} was not released", a.display());
    }
}

/// Test: Concurrent allocation never hands out overlapping namespaces
/// Given task ids that sanitize to the same name
/// When they are allocated from many threads at once
/// Then every namespace is distinct and disjoint
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocation_is_disjoint() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(
        IsolationManager::new(IsolationConfig {
            max_active: 64,
            ..IsolationConfig::new(dir.path())
        })
        .unwrap(),
    );
    let run_id = RunId::new();
    let ids = ["job/1", "job 1", "job:1", "job-1", "../job", "job\\1"];
    let allocations = (0..24).map(|i| {
        let manager = manager.clone();
        let task = TaskId::new(format!("{}#{}", ids[i % ids.len()], i));
        tokio::task::spawn_blocking(move || manager.allocate(&run_id, &task))
    });

    let contexts: Vec<IsolationContext> = join_all(allocations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(manager.active_count(), 24);
    assert_disjoint(&contexts);
    for ctx in &contexts {
        assert!(ctx.namespace.starts_with(dir.path()));
        assert!(ctx.namespace.is_dir());
    }
}

/// Test: The active-context limit holds under concurrent allocation
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocation_respects_capacity() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(
        IsolationManager::new(IsolationConfig {
            max_active: 4,
            ..IsolationConfig::new(dir.path())
        })
        .unwrap(),
    );
    let run_id = RunId::new();
    let allocations = (0..16).map(|i| {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || manager.allocate(&run_id, &TaskId::new(format!("t{}", i))))
    });

    let results: Vec<_> = join_all(allocations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 4);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_backpressure()));
}

/// Test: Contexts become git worktrees when a repository is configured
#[tokio::test]
async fn test_worktree_isolation() {
    let repo = TestRepo::new();
    let h = Harness::with_config(|c| {
        c.repository = Some(repo.path.to_string_lossy().into_owned());
    });
    let orch = &h.orchestrator;
    let submission = orch
        .submit(vec![
            TaskSpec::new("build", json!("test -f README.md && git rev-parse --abbrev-ref HEAD")),
            TaskSpec::new("broken", json!("exit 1")),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.counts.succeeded, 1);
    let branch = report.aggregation.merged["build"].as_str().unwrap().to_string();
    assert!(branch.starts_with("dagrun/"), "branch: {}", branch);
    assert!(branch.contains("/build-"), "branch: {}", branch);

    let retained = orch.isolation().retained();
    assert_eq!(retained.len(), 1);
    assert!(retained[0].worktree);
    assert!(retained[0].namespace.join("README.md").exists());
}

/// Test: Task ids that sanitize alike still get their own worktrees
/// Given tasks "a.b" and "a-b" in one layer of a worktree run
/// When the layer runs
/// Then both succeed on distinct branches
#[tokio::test]
async fn test_worktree_isolation_with_colliding_ids() {
    let repo = TestRepo::new();
    let h = Harness::with_config(|c| {
        c.repository = Some(repo.path.to_string_lossy().into_owned());
    });
    let orch = &h.orchestrator;
    let script = r#"printf '{"branch_%s": "%s"}' "$DAGRUN_TASK_ID" "$(git rev-parse --abbrev-ref HEAD)""#;
    let submission = orch
        .submit(vec![
            TaskSpec::new("a.b", json!(script)),
            TaskSpec::new("a-b", json!(script)),
        ])
        .await
        .unwrap();

    let report = orch.run(submission.run_id).await.unwrap();
    assert_eq!(report.counts.succeeded, 2);
    let dotted = report.aggregation.merged["branch_a.b"].as_str().unwrap();
    let dashed = report.aggregation.merged["branch_a-b"].as_str().unwrap();
    assert_ne!(dotted, dashed);
    assert_eq!(orch.isolation().live_count(), 0);
}
