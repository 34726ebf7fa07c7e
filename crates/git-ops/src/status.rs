//! Workspace status probes for the git panel.

use std::path::Path;

use serde::Serialize;

use crate::commands::git;
use crate::repo::is_git_repo;

/// Snapshot of one exposed workspace directory.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub path: String,
    pub name: String,
    pub is_git_repo: bool,
    pub has_remote: bool,
    pub branch: String,
    pub ahead_count: u32,
    pub behind_count: u32,
}

/// Probe one workspace directory. Never fails: a directory that is not a
/// repository simply reports `is_git_repo: false`.
pub async fn workspace_status(path: &Path) -> WorkspaceStatus {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut status = WorkspaceStatus {
        path: path.to_string_lossy().to_string(),
        name,
        is_git_repo: false,
        has_remote: false,
        branch: String::new(),
        ahead_count: 0,
        behind_count: 0,
    };

    if !is_git_repo(path).await {
        return status;
    }
    status.is_git_repo = true;

    if let Ok(out) = git(path, &["symbolic-ref", "--short", "HEAD"]).await {
        if out.success {
            status.branch = out.stdout.trim().to_string();
        }
    }

    // Upstream tracking branch, if one is configured.
    let upstream = match git(
        path,
        &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
    )
    .await
    {
        Ok(out) if out.success => out.stdout.trim().to_string(),
        _ => return status,
    };
    status.has_remote = true;

    if let Ok(out) = git(
        path,
        &[
            "rev-list",
            "--left-right",
            "--count",
            &format!("{upstream}...HEAD"),
        ],
    )
    .await
    {
        if out.success {
            let counts: Vec<&str> = out.stdout.split_whitespace().collect();
            if counts.len() == 2 {
                status.behind_count = counts[0].parse().unwrap_or(0);
                status.ahead_count = counts[1].parse().unwrap_or(0);
            }
        }
    }

    status
}
