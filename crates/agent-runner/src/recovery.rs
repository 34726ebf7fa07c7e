//! Startup reconciliation: interrupted tasks and orphaned worktrees.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};
use uuid::Uuid;

use foreman_core::{EventKind, Store, TaskStatus};

use crate::runner::Runner;

/// Mark every task that was mid-flight when the server died as failed.
///
/// No container survives a restart, so `in_progress` and `committing` are
/// unsatisfiable states at startup.
pub async fn recover_orphaned_tasks(store: &Store) {
    for task in store.list_tasks(true).await {
        if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Committing) {
            continue;
        }
        warn!(task = %task.id, status = %task.status, "task was interrupted at startup, marking as failed");

        let _ = store.update_task_status(task.id, TaskStatus::Failed).await;
        let _ = store
            .insert_event(
                task.id,
                EventKind::Error,
                serde_json::json!({
                    "error": format!("server restarted while task was {}", task.status)
                }),
            )
            .await;
        let _ = store
            .insert_event(
                task.id,
                EventKind::StateChange,
                serde_json::json!({"from": task.status.as_str(), "to": "failed"}),
            )
            .await;
    }
}

impl Runner {
    /// Remove worktree directories that no known task owns.
    ///
    /// Each stale entry is first detached from every workspace repo with
    /// `git worktree remove --force` (and its task branch deleted when the
    /// directory name is a task UUID), then deleted from the filesystem.
    pub async fn prune_orphaned_worktrees(&self) {
        let known: HashSet<Uuid> = self
            .store
            .list_tasks(true)
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut entries = match tokio::fs::read_dir(&self.config.worktrees_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "prune: cannot read worktrees dir");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let task_id = Uuid::parse_str(&name).ok();

            if let Some(id) = task_id {
                if known.contains(&id) {
                    continue;
                }
            }

            info!(dir = %path.display(), "pruning orphaned worktree directory");
            self.detach_worktrees_under(&path, task_id).await;
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                warn!(dir = %path.display(), error = %err, "prune: remove dir");
            }
        }
    }

    /// Unregister every per-workspace worktree under an orphaned task dir.
    async fn detach_worktrees_under(&self, task_dir: &Path, task_id: Option<Uuid>) {
        let branch = task_id
            .map(|id| format!("task/{}", &id.to_string()[..8]))
            .unwrap_or_default();

        for workspace in &self.config.workspaces {
            if !git_ops::is_git_repo(workspace).await {
                continue;
            }
            let Some(basename) = workspace.file_name() else {
                continue;
            };
            let worktree = task_dir.join(basename);
            if !worktree.exists() {
                continue;
            }
            if branch.is_empty() {
                let wt = worktree.to_string_lossy();
                let _ = git_ops::git(workspace, &["worktree", "remove", "--force", wt.as_ref()])
                    .await;
                let _ = git_ops::git(workspace, &["worktree", "prune"]).await;
            } else if let Err(err) = git_ops::remove_worktree(workspace, &worktree, &branch).await {
                warn!(workspace = %workspace.display(), error = %err, "prune: detach worktree");
            }
        }
    }
}
