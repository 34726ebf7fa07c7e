//! Rebase, merge, and divergence checks for the commit pipeline.

use std::path::Path;

use crate::commands::{git, git_checked};
use crate::error::{GitError, Result};
use crate::repo::default_branch;

/// Whether git output describes a merge/rebase conflict.
pub fn is_conflict_output(output: &str) -> bool {
    output.contains("CONFLICT (content):")
        || output.contains("Merge conflict")
        || output.to_lowercase().contains("conflict")
}

/// Number of commits the repo's default branch has beyond the worktree HEAD.
pub async fn commits_behind(repo: &Path, worktree_path: &Path) -> Result<u32> {
    let def = default_branch(repo).await?;
    let out = git_checked(
        worktree_path,
        &["rev-list", "--count", &format!("HEAD..{def}")],
    )
    .await?;
    out.trim().parse().map_err(|_| GitError::CommandFailed {
        command: "rev-list --count".to_string(),
        dir: worktree_path.to_path_buf(),
        output: out.trim().to_string(),
    })
}

/// Whether `path`'s HEAD has commits not reachable from `reference`.
pub async fn has_commits_ahead_of(path: &Path, reference: &str) -> Result<bool> {
    let out = git_checked(path, &["rev-list", "--count", &format!("{reference}..HEAD")]).await?;
    let count: u32 = out.trim().parse().map_err(|_| GitError::CommandFailed {
        command: "rev-list --count".to_string(),
        dir: path.to_path_buf(),
        output: out.trim().to_string(),
    })?;
    Ok(count > 0)
}

/// Rebase the worktree onto the repo's default branch.
///
/// A conflict returns [`GitError::Conflict`] and leaves the worktree
/// mid-rebase for the resolver. Any other failure aborts the rebase before
/// surfacing.
pub async fn rebase_onto_default(repo: &Path, worktree_path: &Path) -> Result<()> {
    let def = default_branch(repo).await?;

    let out = git(worktree_path, &["rebase", &def]).await?;
    if out.success {
        return Ok(());
    }

    let combined = out.combined();
    if is_conflict_output(&combined) {
        return Err(GitError::Conflict(combined.trim().to_string()));
    }

    let _ = git(worktree_path, &["rebase", "--abort"]).await;
    Err(GitError::CommandFailed {
        command: format!("rebase {def}"),
        dir: worktree_path.to_path_buf(),
        output: combined.trim().to_string(),
    })
}

/// Fast-forward-only merge of `branch_name` into the repo's current branch.
pub async fn ff_merge(repo: &Path, branch_name: &str) -> Result<()> {
    git_checked(repo, &["merge", "--ff-only", branch_name]).await?;
    Ok(())
}
