//! HTTP error mapping.
//!
//! Error bodies are plain text; the store's not-found sentinel becomes 404,
//! invalid input 400, and everything else 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, message).into_response()
    }
}

impl From<foreman_core::Error> for ApiError {
    fn from(err: foreman_core::Error) -> Self {
        match err {
            foreman_core::Error::TaskNotFound(_) => Self::NotFound(err.to_string()),
            foreman_core::Error::InvalidInput(_) | foreman_core::Error::StateViolation(_) => {
                Self::BadRequest(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<agent_runner::RunnerError> for ApiError {
    fn from(err: agent_runner::RunnerError) -> Self {
        Self::Internal(err.to_string())
    }
}
