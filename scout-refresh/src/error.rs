//! Error types for scout-refresh

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Scheduler-internal failures
///
/// Provider failures never show up here; they are classified as
/// [`crate::models::FetchResult`] and handled inside the worker pool.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// Persistence failure (possibly after retries)
    #[error("Persistence error: {0}")]
    Store(#[from] scout_common::Error),

    /// Task addressed to a lane that is not configured
    #[error("Unknown lane: {0}")]
    UnknownLane(String),

    /// Worker pool no longer accepts tasks
    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (409), e.g. start while already running
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Refresh(RefreshError::ShuttingDown) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SHUTTING_DOWN",
                RefreshError::ShuttingDown.to_string(),
            ),
            ApiError::Refresh(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "REFRESH_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
