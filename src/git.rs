use std::path::{Path, PathBuf};

use git2::{ErrorCode, Repository};

use crate::Result;

/// Git worktree and branch operations backing isolation contexts.
#[derive(Debug, Clone)]
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

    /// Create a worktree at `worktree_path` checked out on `branch`.
    ///
    /// The branch is created from HEAD unless it already exists, in which
    /// case the worktree is attached to the existing branch.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        tracing::debug!(branch, path = %worktree_path.display(), "creating worktree");
        let repo = self.repo()?;
        let branch_obj = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(existing) => existing,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let commit = repo.head()?.peel_to_commit()?;
                repo.branch(branch, &commit, false)?
            }
            Err(e) => return Err(e.into()),
        };
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes, so the folder name names the worktree.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree directory and prune its admin entry.
    ///
    /// Cleanup continues past individual failures; git must forget the
    /// worktree or the branch stays "checked out" and cannot be deleted.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        tracing::debug!(path = %worktree_path.display(), "removing worktree");
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        let worktrees = repo.worktrees()?;
        let worktree_name = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(String::from);

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        if let Some(name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(&name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    tracing::warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
            let admin_dir = repo.path().join("worktrees").join(&name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Delete a local branch. Returns Ok even if the branch doesn't exist.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    tracing::warn!(branch, error = %e, "failed to delete branch");
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                tracing::debug!(branch, "branch already gone");
            }
            Err(e) => {
                tracing::warn!(branch, error = %e, "error looking up branch");
            }
        }
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = repo.find_branch(branch, git2::BranchType::Local);
        match found {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
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
}
