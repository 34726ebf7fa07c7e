//! Error types for container invocation and the execution pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The container exited non-zero without producing parseable output.
    #[error("container exited with code {code}: {stderr}")]
    ContainerExited { code: i32, stderr: String },

    #[error("empty output from container")]
    EmptyOutput,

    #[error("parse agent output: {0}")]
    Parse(String),

    /// The run was cancelled by an operator action.
    #[error("container run cancelled")]
    Cancelled,

    /// The task's timeout elapsed while the container was running.
    #[error("container run timed out")]
    Timeout,

    /// Commit-pipeline failure with phase context attached.
    #[error("{0}")]
    Pipeline(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] foreman_core::Error),

    #[error(transparent)]
    Git(#[from] git_ops::GitError),
}
