//! Error types for the core library

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Sentinel for lookups of unknown tasks; the HTTP facade maps this to 404.
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation that is only legal in a particular task status.
    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
