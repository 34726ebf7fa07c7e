//! Non-git workspace snapshots.
//!
//! A workspace without version control is copied into a throwaway git
//! repository with a single "initial snapshot" commit, so the rest of the
//! pipeline (commits, divergence checks, diffs) works uniformly. At the end
//! of a task the files are copied back; conflicts are impossible because the
//! user's directory is only touched at extraction time.

use std::path::Path;

use git_ops::git_checked;

use crate::error::{Result, RunnerError};

/// Directory names never copied into a snapshot.
const SNAPSHOT_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".venv",
    "venv",
    "__pycache__",
    ".DS_Store",
];

/// Copy `workspace` into `dest` and convert the copy into a one-commit git
/// repository.
pub(crate) async fn snapshot_workspace(workspace: &Path, dest: &Path) -> Result<()> {
    let source = workspace.to_path_buf();
    let target = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&source, &target, &is_excluded))
        .await
        .map_err(|e| RunnerError::Pipeline(format!("snapshot copy task failed: {e}")))??;

    git_checked(dest, &["init", "-b", "main"]).await?;
    git_checked(dest, &["config", "user.email", "foreman@localhost"]).await?;
    git_checked(dest, &["config", "user.name", "foreman"]).await?;
    git_checked(dest, &["add", "-A"]).await?;
    git_checked(
        dest,
        &["commit", "--allow-empty", "-m", "initial snapshot"],
    )
    .await?;
    Ok(())
}

/// Copy a finished snapshot's files back over the original workspace,
/// excluding the throwaway `.git` directory.
pub(crate) async fn extract_snapshot_to_workspace(worktree: &Path, workspace: &Path) -> Result<()> {
    let source = worktree.to_path_buf();
    let target = workspace.to_path_buf();
    tokio::task::spawn_blocking(move || {
        copy_tree(&source, &target, &|name| name == ".git")
    })
    .await
    .map_err(|e| RunnerError::Pipeline(format!("snapshot extract task failed: {e}")))??;
    Ok(())
}

fn is_excluded(name: &str) -> bool {
    SNAPSHOT_EXCLUDES.contains(&name)
}

fn copy_tree(src: &Path, dst: &Path, exclude: &dyn Fn(&str) -> bool) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if exclude(&name.to_string_lossy()) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to, exclude)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)?;
        }
        // Symlinks are skipped; a sandbox snapshot should not follow links
        // out of the workspace.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn snapshot_creates_single_commit_repo() {
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("notes.txt"), "hello").unwrap();
        std::fs::create_dir_all(workspace.path().join("node_modules/junk")).unwrap();
        std::fs::write(workspace.path().join("node_modules/junk/big.js"), "x").unwrap();

        let dest_parent = TempDir::new().unwrap();
        let dest = dest_parent.path().join("snap");
        snapshot_workspace(workspace.path(), &dest).await.unwrap();

        assert!(dest.join("notes.txt").exists());
        assert!(!dest.join("node_modules").exists(), "noise dirs are excluded");
        assert!(git_ops::is_git_repo(&dest).await);

        let log = git_checked(&dest, &["log", "--oneline"]).await.unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("initial snapshot"));
    }

    #[tokio::test]
    async fn extract_copies_back_without_git_dir() {
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("a.txt"), "old").unwrap();

        let dest_parent = TempDir::new().unwrap();
        let dest = dest_parent.path().join("snap");
        snapshot_workspace(workspace.path(), &dest).await.unwrap();

        // Simulate agent edits inside the snapshot.
        std::fs::write(dest.join("a.txt"), "new").unwrap();
        std::fs::write(dest.join("created.txt"), "fresh").unwrap();

        extract_snapshot_to_workspace(&dest, workspace.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(workspace.path().join("a.txt")).unwrap(),
            "new"
        );
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("created.txt")).unwrap(),
            "fresh"
        );
        assert!(!workspace.path().join(".git").exists());
    }
}
