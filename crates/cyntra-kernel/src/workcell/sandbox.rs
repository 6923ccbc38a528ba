//! Sandboxes - isolated git worktrees that workcells run in.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use serde::{Deserialize, Serialize};

use super::WorkcellId;

/// An acquired isolated filesystem view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Worktree name
    pub name: String,
    pub path: PathBuf,
    /// Branch the workcell commits to
    pub branch: String,
}

/// Materializes and tears down workcell sandboxes.
///
/// `release` must tolerate being called for a sandbox that is already gone.
pub trait WorktreeProvider: Send + Sync {
    fn acquire(&self, issue_id: &str, workcell_id: &WorkcellId) -> Result<Sandbox>;

    /// Remove the sandbox. With `keep_branch` the branch survives for merging.
    fn release(&self, sandbox: &Sandbox, keep_branch: bool) -> Result<()>;
}

/// Workcell metadata marker.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkcellMarker {
    pub id: String,
    pub issue_id: String,
    pub created: String,
    pub parent_commit: String,
    pub branch: String,
}

/// Git worktrees cut from the base branch.
pub struct GitWorktrees {
    repo_root: PathBuf,
    workcells_dir: PathBuf,
    base_branch: String,
}

impl GitWorktrees {
    pub fn new(repo_root: &Path, workcells_dir: &Path, base_branch: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            workcells_dir: workcells_dir.to_path_buf(),
            base_branch: base_branch.into(),
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.repo_root)
            .with_context(|| format!("Failed to open repository at {}", self.repo_root.display()))
    }
}

impl WorktreeProvider for GitWorktrees {
    fn acquire(&self, issue_id: &str, workcell_id: &WorkcellId) -> Result<Sandbox> {
        let repo = self.open()?;
        let branch_name = format!("wc/{}/{}", issue_id, workcell_id);
        let path = self.workcells_dir.join(workcell_id.as_str());

        tracing::info!(
            workcell_id = %workcell_id,
            issue_id = %issue_id,
            "Creating workcell"
        );

        let base = repo
            .find_branch(&self.base_branch, BranchType::Local)
            .with_context(|| format!("Base branch {} not found", self.base_branch))?;
        let parent = base.get().peel_to_commit()?;

        std::fs::create_dir_all(&self.workcells_dir)
            .with_context(|| format!("Failed to create {}", self.workcells_dir.display()))?;

        let mut branch = repo
            .branch(&branch_name, &parent, false)
            .with_context(|| format!("Failed to create branch {}", branch_name))?;

        let added = {
            let mut opts = WorktreeAddOptions::new();
            opts.reference(Some(branch.get()));
            repo.worktree(workcell_id.as_str(), &path, Some(&opts))
                .map(|_| ())
        };
        if let Err(e) = added {
            let _ = branch.delete();
            return Err(e).context("Failed to create git worktree");
        }

        // Remove kernel-owned directories from workcell
        let _ = std::fs::remove_dir_all(path.join(".beads"));
        let _ = std::fs::remove_dir_all(path.join(".cyntra"));

        let marker = WorkcellMarker {
            id: workcell_id.to_string(),
            issue_id: issue_id.to_string(),
            created: Utc::now().to_rfc3339(),
            parent_commit: parent.id().to_string(),
            branch: branch_name.clone(),
        };
        std::fs::write(path.join(".workcell"), serde_json::to_string_pretty(&marker)?)?;

        tracing::info!(
            workcell_id = %workcell_id,
            path = %path.display(),
            "Workcell created"
        );

        Ok(Sandbox {
            name: workcell_id.to_string(),
            path,
            branch: branch_name,
        })
    }

    fn release(&self, sandbox: &Sandbox, keep_branch: bool) -> Result<()> {
        let repo = self.open()?;

        tracing::info!(
            workcell_id = %sandbox.name,
            keep_branch,
            "Cleaning up workcell"
        );

        if let Ok(worktree) = repo.find_worktree(&sandbox.name) {
            let mut prune = WorktreePruneOptions::new();
            prune.valid(true).locked(true).working_tree(true);
            worktree
                .prune(Some(&mut prune))
                .with_context(|| format!("Failed to prune worktree {}", sandbox.name))?;
        }
        if sandbox.path.exists() {
            std::fs::remove_dir_all(&sandbox.path)
                .with_context(|| format!("Failed to remove {}", sandbox.path.display()))?;
        }

        if !keep_branch {
            if let Ok(mut branch) = repo.find_branch(&sandbox.branch, BranchType::Local) {
                branch
                    .delete()
                    .with_context(|| format!("Failed to delete branch {}", sandbox.branch))?;
            }
        }

        Ok(())
    }
}
