//! Repository-level probes and stash helpers.

use std::path::Path;

use tracing::debug;

use crate::commands::{git, git_checked};
use crate::error::Result;

/// Whether `path` is inside a git repository. Missing paths and plain
/// directories both report `false`.
pub async fn is_git_repo(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    match git(path, &["rev-parse", "--git-dir"]).await {
        Ok(out) => out.success,
        Err(_) => false,
    }
}

/// Resolve the canonical integration branch of a repository.
///
/// Prefers the `origin/HEAD` symref, then the branch HEAD currently points
/// at, and falls back to `main` (e.g. detached HEAD with no remote).
pub async fn default_branch(repo: &Path) -> Result<String> {
    if let Ok(out) = git(repo, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]).await {
        if out.success {
            let full = out.stdout.trim();
            if let Some(branch) = full.strip_prefix("origin/") {
                if !branch.is_empty() {
                    return Ok(branch.to_string());
                }
            }
        }
    }

    let head = git(repo, &["symbolic-ref", "--short", "HEAD"]).await?;
    if head.success {
        let branch = head.stdout.trim();
        if !branch.is_empty() {
            return Ok(branch.to_string());
        }
    }

    Ok("main".to_string())
}

/// HEAD commit hash (full 40-character SHA).
pub async fn commit_hash(path: &Path) -> Result<String> {
    let out = git_checked(path, &["rev-parse", "HEAD"]).await?;
    Ok(out.trim().to_string())
}

/// Stash tracked and untracked changes if the working tree is dirty.
/// Returns whether anything was stashed.
pub async fn stash_if_dirty(repo: &Path) -> bool {
    let dirty = match git(repo, &["status", "--porcelain"]).await {
        Ok(out) => out.success && !out.stdout.trim().is_empty(),
        Err(_) => false,
    };
    if !dirty {
        return false;
    }
    match git(repo, &["stash", "push", "-u"]).await {
        Ok(out) => out.success,
        Err(_) => false,
    }
}

/// Pop the most recent stash entry, best-effort.
pub async fn stash_pop(repo: &Path) {
    match git(repo, &["stash", "pop"]).await {
        Ok(out) if !out.success => {
            debug!(repo = %repo.display(), output = %out.combined().trim(), "stash pop skipped");
        }
        Err(err) => {
            debug!(repo = %repo.display(), error = %err, "stash pop failed");
        }
        _ => {}
    }
}
