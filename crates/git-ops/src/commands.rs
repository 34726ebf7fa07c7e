//! Git command execution utilities

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{GitError, Result};

/// Output from a git command.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    /// Stdout and stderr concatenated, for error reporting and conflict
    /// phrase matching.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run `git <args>` with `dir` as the repository context (`git -C <dir>`).
pub async fn git(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    debug!(?args, dir = %dir.display(), "running git");

    let dir_str = dir.to_string_lossy();
    let output = Command::new("git")
        .arg("-C")
        .arg(dir_str.as_ref())
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    trace!(%stdout, %stderr, "git output");

    Ok(GitOutput {
        stdout,
        stderr,
        success: output.status.success(),
    })
}

/// Run a git command and fail with its combined output when it exits
/// non-zero.
pub async fn git_checked(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args).await?;
    if !output.success {
        return Err(GitError::CommandFailed {
            command: args.join(" "),
            dir: dir.to_path_buf(),
            output: output.combined().trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::setup_repo;

    #[tokio::test]
    async fn checked_returns_stdout() {
        let repo = setup_repo().await;
        let out = git_checked(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert_eq!(out.trim(), "main");
    }

    #[tokio::test]
    async fn checked_embeds_output_on_failure() {
        let repo = setup_repo().await;
        let err = git_checked(repo.path(), &["rev-parse", "--verify", "no-such-ref"])
            .await
            .unwrap_err();
        match err {
            GitError::CommandFailed { command, output, .. } => {
                assert!(command.contains("rev-parse"));
                assert!(!output.is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
