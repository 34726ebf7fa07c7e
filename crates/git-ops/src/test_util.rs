//! Shared helpers for git integration tests.

use std::path::Path;

use tempfile::TempDir;

/// Run git in `dir`, panicking on failure with the combined output.
pub(crate) async fn git_run(dir: &Path, args: &[&str]) -> String {
    let out = crate::commands::git(dir, args).await.expect("spawn git");
    assert!(
        out.success,
        "git {args:?} in {} failed:\n{}",
        dir.display(),
        out.combined()
    );
    out.stdout.trim().to_string()
}

/// Initialize a scratch repository on `main` with one commit.
pub(crate) async fn setup_repo() -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    git_run(dir.path(), &["init", "-b", "main"]).await;
    git_run(dir.path(), &["config", "user.email", "test@example.com"]).await;
    git_run(dir.path(), &["config", "user.name", "Test"]).await;
    std::fs::write(dir.path().join("file.txt"), "initial\n").expect("write file");
    git_run(dir.path(), &["add", "."]).await;
    git_run(dir.path(), &["commit", "-m", "initial commit"]).await;
    dir
}

/// Add a commit touching `name` with `content`.
pub(crate) async fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    std::fs::write(dir.join(name), content).expect("write file");
    git_run(dir, &["add", "."]).await;
    git_run(dir, &["commit", "-m", message]).await;
}
