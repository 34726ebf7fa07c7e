//! Error types for git operations

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Debug, Error)]
pub enum GitError {
    /// A git subprocess exited non-zero; `output` is its combined
    /// stdout+stderr.
    #[error("git {command} failed in {dir}: {output}")]
    CommandFailed {
        command: String,
        dir: PathBuf,
        output: String,
    },

    /// A rebase stopped on conflicting hunks. The worktree is left mid-rebase
    /// so a resolver can pick it up.
    #[error("rebase conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
