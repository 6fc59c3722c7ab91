//! Version control operations backing workspace isolation.
//!
//! [`VersionControl`] is the seam the workspace manager talks to. [`GitOps`]
//! implements it with git2 worktrees: each workspace is a linked worktree on
//! its own branch, and finished branches are merged into an integration
//! branch entirely in memory, so the user's checkout is never touched.

use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature};

use crate::{Error, Result};

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Target already contained the branch.
    UpToDate,
    /// Target was moved forward to the branch tip.
    FastForward { commit: String },
    /// A merge commit was created on the target.
    Merged { commit: String },
}

/// Operations the workspace manager needs from a version control system.
///
/// Implementations surface conflicts as [`Error::MergeConflict`] and other
/// failures unchanged.
pub trait VersionControl: Send + Sync {
    /// Create `name` from `base` (a branch name), or from HEAD when `None`.
    fn create_branch(&self, name: &str, base: Option<&str>) -> Result<()>;

    fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Check out `branch` into a new worktree at `path`, creating the branch
    /// from `base` first if it does not exist.
    fn create_worktree(&self, branch: &str, path: &Path, base: Option<&str>) -> Result<()>;

    /// Whether the worktree at `path` has uncommitted changes.
    fn is_dirty(&self, path: &Path) -> Result<bool>;

    fn commit_all(&self, path: &Path, message: &str) -> Result<()>;

    fn remove_worktree(&self, path: &Path) -> Result<()>;

    fn delete_branch(&self, name: &str) -> Result<()>;

    /// Push `branch` to the default remote from the worktree at `path`.
    fn push(&self, path: &Path, branch: &str) -> Result<()>;

    /// Merge `branch` into `target`.
    fn merge(&self, branch: &str, target: &str) -> Result<MergeOutcome>;

    /// Drop stale worktree bookkeeping. Best effort.
    fn prune(&self) -> Result<()> {
        Ok(())
    }
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Commit id at the tip of a local branch.
    pub fn branch_commit(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    fn base_commit<'r>(repo: &'r Repository, base: Option<&str>) -> Result<git2::Commit<'r>> {
        match base {
            Some(name) => Ok(repo
                .find_branch(name, BranchType::Local)?
                .into_reference()
                .peel_to_commit()?),
            None => Ok(repo.head()?.peel_to_commit()?),
        }
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("conductor", "conductor@localhost"))?)
    }

    /// Clean up the git worktree admin directory (.git/worktrees/<name>).
    fn cleanup_worktree_admin_dir(repo: &Repository, worktree_name: &str) {
        let admin_dir = repo.path().join("worktrees").join(worktree_name);
        if admin_dir.exists() {
            tracing::debug!(dir = %admin_dir.display(), "removing worktree admin dir");
            let _ = std::fs::remove_dir_all(&admin_dir);
        }
    }

    fn prune_options() -> git2::WorktreePruneOptions {
        let mut opts = git2::WorktreePruneOptions::new();
        opts.valid(true).working_tree(true).locked(true);
        opts
    }

    fn conflicted_paths(index: &git2::Index) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| PathBuf::from(String::from_utf8_lossy(&e.path).to_string()));
            if let Some(path) = path {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl VersionControl for GitOps {
    fn create_branch(&self, name: &str, base: Option<&str>) -> Result<()> {
        tracing::debug!(branch = name, ?base, "GitOps::create_branch");
        let repo = self.repo()?;
        let commit = Self::base_commit(&repo, base)?;
        repo.branch(name, &commit, false)?;
        Ok(())
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    fn create_worktree(&self, branch: &str, path: &Path, base: Option<&str>) -> Result<()> {
        tracing::debug!(branch, path = %path.display(), ?base, "GitOps::create_worktree");
        let repo = self.repo()?;
        let branch_obj = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let commit = Self::base_commit(&repo, base)?;
                repo.branch(branch, &commit, false)?
            }
            Err(e) => return Err(e.into()),
        };
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name.
        let worktree_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Vcs(format!("invalid worktree path: {}", path.display())))?;
        repo.worktree(worktree_name, path, Some(&opts))?;
        Ok(())
    }

    fn is_dirty(&self, path: &Path) -> Result<bool> {
        let repo = Repository::open(path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    fn commit_all(&self, path: &Path, message: &str) -> Result<()> {
        tracing::debug!(path = %path.display(), message, "GitOps::commit_all");
        let repo = Repository::open(path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!(%commit_id, "commit created");
        Ok(())
    }

    /// Remove a worktree and its admin directory.
    ///
    /// The admin directory must go as well, otherwise git still considers the
    /// branch checked out and refuses to delete it.
    fn remove_worktree(&self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let folder_name = path.file_name().and_then(|n| n.to_str()).map(String::from);

        let worktree_name = repo
            .worktrees()?
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == path)
                    .unwrap_or(false)
                    || Some(*name) == folder_name.as_deref()
            })
            .map(String::from);

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut Self::prune_options())) {
                    tracing::warn!(worktree = %name, "worktree prune failed: {}", e);
                }
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }

        for name in worktree_name.iter().chain(folder_name.iter()) {
            Self::cleanup_worktree_admin_dir(&repo, name);
        }
        Ok(())
    }

    /// Delete a local branch. Missing branches are not an error.
    fn delete_branch(&self, name: &str) -> Result<()> {
        tracing::debug!(branch = name, "GitOps::delete_branch");
        let repo = self.repo()?;
        match repo.find_branch(name, BranchType::Local) {
            Ok(mut branch) => {
                if let Err(e) = branch.delete() {
                    tracing::warn!(branch = name, "failed to delete branch: {}", e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                tracing::debug!(branch = name, "branch already gone");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn push(&self, path: &Path, branch: &str) -> Result<()> {
        tracing::debug!(branch, "GitOps::push");
        let output = Command::new("git")
            .args(["push", "--set-upstream", "origin", branch])
            .current_dir(path)
            .output()?;
        if !output.status.success() {
            return Err(Error::Vcs(format!(
                "git push {} failed: {}",
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Merge `branch` into `target` without touching any checkout.
    ///
    /// `target` must not be checked out anywhere: its ref is moved directly.
    fn merge(&self, branch: &str, target: &str) -> Result<MergeOutcome> {
        tracing::debug!(branch, target, "GitOps::merge");
        let repo = self.repo()?;
        let theirs = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let ours = repo
            .find_branch(target, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let target_ref = format!("refs/heads/{}", target);

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            return Ok(MergeOutcome::UpToDate);
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference(
                &target_ref,
                theirs.id(),
                true,
                &format!("conductor: fast-forward {} to {}", target, branch),
            )?;
            return Ok(MergeOutcome::FastForward {
                commit: theirs.id().to_string(),
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let files = Self::conflicted_paths(&index)?;
            return Err(Error::MergeConflict {
                branch: branch.to_string(),
                target: target.to_string(),
                files,
            });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let commit_id = repo.commit(
            Some(&target_ref),
            &sig,
            &sig,
            &format!("Merge {} into {}", branch, target),
            &tree,
            &[&ours, &theirs],
        )?;
        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
        })
    }

    fn prune(&self) -> Result<()> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(worktree) = repo.find_worktree(name) {
                if !worktree.path().exists()
                    && worktree.prune(Some(&mut Self::prune_options())).is_ok()
                {
                    pruned += 1;
                }
            }
        }
        tracing::debug!(pruned, "GitOps::prune");
        Ok(())
    }
}
