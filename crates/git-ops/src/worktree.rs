//! Worktree creation and removal with stale-state recovery.

use std::path::Path;

use tracing::{debug, warn};

use crate::commands::git;
use crate::error::{GitError, Result};

/// Create branch `branch_name` at HEAD and check it out as a worktree at
/// `worktree_path`.
///
/// Stale state from an interrupted run is repaired along the way: a leftover
/// branch is force-deleted and recreated from HEAD, and a worktree directory
/// that was deleted externally (leaving a registration in `.git/worktrees/`)
/// is recovered by re-adding the existing branch with `--force`.
pub async fn create_worktree(repo: &Path, worktree_path: &Path, branch_name: &str) -> Result<()> {
    let wt = worktree_path.to_string_lossy();

    let mut out = git(
        repo,
        &["worktree", "add", "-b", branch_name, wt.as_ref(), "HEAD"],
    )
    .await?;

    if !out.success && out.combined().contains("already exists") {
        // Stale branch from a previous failed cleanup: delete it and retry so
        // the task starts fresh from HEAD.
        debug!(branch = branch_name, "deleting stale branch before retry");
        let _ = git(repo, &["branch", "-D", branch_name]).await;
        out = git(
            repo,
            &["worktree", "add", "-b", branch_name, wt.as_ref(), "HEAD"],
        )
        .await?;
    }

    if out.success {
        return Ok(());
    }

    let combined = out.combined();
    if combined.contains("already exists") || combined.contains("already registered worktree") {
        let recovered = git(repo, &["worktree", "add", "--force", wt.as_ref(), branch_name]).await?;
        if recovered.success {
            return Ok(());
        }
        return Err(GitError::CommandFailed {
            command: format!("worktree add --force {wt} {branch_name}"),
            dir: repo.to_path_buf(),
            output: recovered.combined().trim().to_string(),
        });
    }

    Err(GitError::CommandFailed {
        command: format!("worktree add -b {branch_name} {wt} HEAD"),
        dir: repo.to_path_buf(),
        output: combined.trim().to_string(),
    })
}

/// Force-remove a worktree and best-effort delete its branch. Idempotent:
/// paths that were never registered, or whose directory already vanished,
/// succeed after pruning stale refs.
pub async fn remove_worktree(repo: &Path, worktree_path: &Path, branch_name: &str) -> Result<()> {
    let wt = worktree_path.to_string_lossy();

    let out = git(repo, &["worktree", "remove", "--force", wt.as_ref()]).await?;
    if !out.success {
        let combined = out.combined();
        if combined.contains("not a worktree")
            || combined.contains("not a working tree")
            || combined.contains("not found")
        {
            let _ = git(repo, &["worktree", "prune"]).await;
        } else {
            return Err(GitError::CommandFailed {
                command: format!("worktree remove --force {wt}"),
                dir: repo.to_path_buf(),
                output: combined.trim().to_string(),
            });
        }
    }

    // Always attempted, so stale branches are cleaned up even when the
    // worktree directory was already missing.
    if let Ok(del) = git(repo, &["branch", "-D", branch_name]).await {
        if !del.success {
            debug!(branch = branch_name, "branch delete skipped");
        }
    } else {
        warn!(branch = branch_name, "branch delete could not run");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{git_run, setup_repo};
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_fresh_worktree_and_branch() {
        let repo = setup_repo().await;
        let wt_parent = TempDir::new().unwrap();
        let wt = wt_parent.path().join("wt");

        create_worktree(repo.path(), &wt, "new-branch").await.unwrap();
        assert!(wt.is_dir());

        remove_worktree(repo.path(), &wt, "new-branch").await.unwrap();
    }

    #[tokio::test]
    async fn stale_branch_is_force_deleted_then_recreated() {
        let repo = setup_repo().await;
        git_run(repo.path(), &["branch", "stale"]).await;
        let wt_parent = TempDir::new().unwrap();
        let wt = wt_parent.path().join("wt");

        create_worktree(repo.path(), &wt, "stale").await.unwrap();
        remove_worktree(repo.path(), &wt, "stale").await.unwrap();
    }

    #[tokio::test]
    async fn externally_deleted_directory_recovers_via_force() {
        let repo = setup_repo().await;
        let wt_parent = TempDir::new().unwrap();
        let wt = wt_parent.path().join("wt");

        create_worktree(repo.path(), &wt, "orphan").await.unwrap();
        std::fs::remove_dir_all(&wt).unwrap();

        create_worktree(repo.path(), &wt, "orphan").await.unwrap();
        remove_worktree(repo.path(), &wt, "orphan").await.unwrap();
    }

    #[tokio::test]
    async fn remove_deletes_worktree_and_branch() {
        let repo = setup_repo().await;
        let wt_parent = TempDir::new().unwrap();
        let wt = wt_parent.path().join("wt");
        create_worktree(repo.path(), &wt, "rm-branch").await.unwrap();

        remove_worktree(repo.path(), &wt, "rm-branch").await.unwrap();
        assert!(!wt.exists());

        let check = git(repo.path(), &["rev-parse", "--verify", "refs/heads/rm-branch"])
            .await
            .unwrap();
        assert!(!check.success, "branch should be gone");
    }

    #[tokio::test]
    async fn remove_is_idempotent_for_unregistered_path() {
        let repo = setup_repo().await;
        let ghost = TempDir::new().unwrap().path().join("ghost");
        remove_worktree(repo.path(), &ghost, "ghost-branch")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_is_graceful_when_directory_deleted_externally() {
        let repo = setup_repo().await;
        let wt_parent = TempDir::new().unwrap();
        let wt = wt_parent.path().join("wt");
        create_worktree(repo.path(), &wt, "del-branch").await.unwrap();
        std::fs::remove_dir_all(&wt).unwrap();

        remove_worktree(repo.path(), &wt, "del-branch").await.unwrap();
    }
}
