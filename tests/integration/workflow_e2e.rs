//! End-to-end orchestration tests.
//!
//! These run complete work items through the `Orchestrator` against a real
//! git repository and check what ends up on the integration branch.

use std::sync::Arc;

use conductor::core::{Capability, TaskNode, WorkItem};
use conductor::git::GitOps;
use conductor::orchestration::{EntryStatus, OrchestrationState, Orchestrator};
use conductor::Error;
use tempfile::TempDir;

use crate::fixtures::*;

struct GitHarness {
    repo: TestRepo,
    _workspaces: TempDir,
    config: conductor::config::Config,
}

fn git_harness(max_concurrency: usize) -> GitHarness {
    let repo = TestRepo::new();
    let workspaces = TempDir::new().unwrap();
    let config = test_config(workspaces.path(), max_concurrency);
    GitHarness {
        repo,
        _workspaces: workspaces,
        config,
    }
}

// ========== Full runs ==========

#[tokio::test]
async fn test_diamond_lands_on_integration_branch() {
    let h = git_harness(2);
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen).writing_files());
    let channel = RecordingChannel::new();
    let orchestrator = Orchestrator::new(
        h.config.clone(),
        registry_of(&[executor.clone()]),
        Arc::new(GitOps::new(&h.repo.path).unwrap()),
        None,
        escalations(&channel),
    )
    .unwrap();

    let handle = orchestrator
        .submit(work_item("Add accounts", diamond()))
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    assert_eq!(report.levels, 3);
    assert_eq!(report.completed_groups(), 4);
    assert!(channel.received().is_empty());

    for task in ["schema", "api", "migrations", "integration"] {
        assert!(
            h.repo
                .file_on_branch(&report.integration_branch, &format!("{}.txt", task))
                .is_some(),
            "{} missing from {}",
            task,
            report.integration_branch
        );
    }
    // conductor's context files never get committed
    assert!(h
        .repo
        .file_on_branch(&report.integration_branch, ".conductor/context.json")
        .is_none());
    // the user's checkout is untouched
    assert!(h.repo.file_on_branch(&h.repo.head_branch(), "schema.txt").is_none());
}

#[tokio::test]
async fn test_later_levels_see_earlier_results() {
    let h = git_harness(1);
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen).writing_files());
    let orchestrator = Orchestrator::new(
        h.config.clone(),
        registry_of(&[executor.clone()]),
        Arc::new(GitOps::new(&h.repo.path).unwrap()),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap();

    let report = orchestrator
        .submit(work_item("Chain", chain(3)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    let calls = executor.calls();
    assert_eq!(calls.len(), 3);
    let levels: Vec<usize> = calls.iter().map(|c| c.level).collect();
    assert_eq!(levels, vec![0, 1, 2]);
    assert_eq!(
        h.repo
            .file_on_branch(&report.integration_branch, "step-2.txt")
            .as_deref(),
        Some("Step 2\n")
    );
}

#[tokio::test]
async fn test_default_plan_uses_every_capability() {
    let h = git_harness(2);
    let executors: Vec<Arc<ScriptedExecutor>> = [
        Capability::Issue,
        Capability::Codegen,
        Capability::Test,
        Capability::Review,
    ]
    .into_iter()
    .map(|c| Arc::new(ScriptedExecutor::new(c)))
    .collect();
    let orchestrator = Orchestrator::new(
        h.config.clone(),
        registry_of(&executors),
        Arc::new(GitOps::new(&h.repo.path).unwrap()),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap();

    let item = WorkItem::new("Fix login redirect", "Users land on a 404 after login");
    let report = orchestrator.submit(item).unwrap().wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    assert_eq!(report.levels, 3);
    for executor in &executors {
        assert_eq!(executor.attempts(), 1);
    }
}

// ========== Rejected submissions ==========

#[tokio::test]
async fn test_cycle_is_rejected_at_submit() {
    let workspaces = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(
        test_config(workspaces.path(), 1),
        registry_of(&[Arc::new(ScriptedExecutor::new(Capability::Codegen))]),
        MemoryVcs::new(),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap();

    let tasks = vec![
        TaskNode::new("a", "A", Capability::Codegen).depends_on("b"),
        TaskNode::new("b", "B", Capability::Codegen).depends_on("a"),
    ];
    let err = orchestrator
        .submit(work_item("Cyclic", tasks))
        .err()
        .unwrap();
    assert!(matches!(err, Error::DependencyCycle { .. }));
}

#[tokio::test]
async fn test_missing_executor_is_rejected_at_submit() {
    let workspaces = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(
        test_config(workspaces.path(), 1),
        registry_of(&[Arc::new(ScriptedExecutor::new(Capability::Codegen))]),
        MemoryVcs::new(),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap();

    let tasks = vec![TaskNode::new("ship", "Ship it", Capability::Deploy)];
    let err = orchestrator.submit(work_item("Deploy", tasks)).err().unwrap();
    assert!(matches!(err, Error::UnknownCapability(Capability::Deploy)));
}

#[tokio::test]
async fn test_single_task_runs_as_one_group() {
    let workspaces = TempDir::new().unwrap();
    let vcs = MemoryVcs::new();
    let orchestrator = Orchestrator::new(
        test_config(workspaces.path(), 1),
        registry_of(&[Arc::new(ScriptedExecutor::new(Capability::Codegen))]),
        vcs,
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap();

    let report = orchestrator
        .submit(work_item("Tiny", independent_tasks(1)))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].status, EntryStatus::Completed);
    assert!(report.groups[0].summary.starts_with("did "));
}
