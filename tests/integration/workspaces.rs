//! Workspace lifecycle across whole orchestrations: what is removed, what
//! is kept, and which branches survive.

use std::sync::Arc;

use conductor::core::Capability;
use conductor::git::GitOps;
use conductor::orchestration::{OrchestrationState, Orchestrator};
use tempfile::TempDir;

use crate::fixtures::*;

fn git_orchestrator(
    repo: &TestRepo,
    root: &TempDir,
    executor: &Arc<ScriptedExecutor>,
    keep_failed: bool,
) -> Orchestrator {
    let mut config = test_config(root.path(), 2);
    config.cleanup.keep_failed = keep_failed;
    config.retry.max_retries = 0;
    Orchestrator::new(
        config,
        registry_of(&[executor.clone()]),
        Arc::new(GitOps::new(&repo.path).unwrap()),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap()
}

fn remaining_dirs(root: &TempDir) -> usize {
    walk(root.path())
}

fn walk(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| 1 + walk(&e.path()))
                .sum()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_successful_run_leaves_only_integration_branch() {
    let repo = TestRepo::new();
    let root = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen).writing_files());
    let report = git_orchestrator(&repo, &root, &executor, true)
        .submit(work_item("Tidy", diamond()))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, OrchestrationState::Completed);

    let mut branches = repo.branches();
    branches.sort();
    let expected = {
        let mut b = vec![repo.head_branch(), report.integration_branch.clone()];
        b.sort();
        b
    };
    assert_eq!(branches, expected);
    assert!(GitOps::new(&repo.path).unwrap().list_worktrees().unwrap().is_empty());
    // only the per-item directory itself remains
    assert!(remaining_dirs(&root) <= 1);
}

#[tokio::test]
async fn test_failed_workspace_is_kept_for_inspection() {
    let repo = TestRepo::new();
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen)
            .writing_files()
            .always_failing("task-0"),
    );
    let report = git_orchestrator(&repo, &root, &executor, true)
        .submit(work_item("Keep", independent_tasks(1)))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, OrchestrationState::Failed);

    let branch = report.groups[0].branch.clone().unwrap();
    assert!(repo.branches().contains(&branch));
    assert_eq!(GitOps::new(&repo.path).unwrap().list_worktrees().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_workspace_removed_but_branch_kept() {
    let repo = TestRepo::new();
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen)
            .writing_files()
            .always_failing("task-0"),
    );
    let report = git_orchestrator(&repo, &root, &executor, false)
        .submit(work_item("Discard", independent_tasks(1)))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, OrchestrationState::Failed);

    // the unmerged branch keeps the auto-committed work
    let branch = report.groups[0].branch.clone().unwrap();
    assert!(repo.branches().contains(&branch));
    assert_eq!(
        repo.file_on_branch(&branch, "task-0.txt").as_deref(),
        Some("Task 0\n")
    );
    assert!(GitOps::new(&repo.path).unwrap().list_worktrees().unwrap().is_empty());
}
