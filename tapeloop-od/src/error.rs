//! Error types for tapeloop-od
//!
//! `OrchestratorError` is the failure taxonomy of the acquisition pipeline.
//! Only store failures are fatal; every other variant is handled inside the
//! dispatcher (logged, retried, or surfaced as a notification).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::{InvalidTransition, TrackId};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Event not legal in the track's current state; the event is dropped
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Recording slot already held; the caller retries on a later tick
    #[error("recording slot busy (held by track {holder})")]
    SlotBusy { holder: TrackId },

    /// Playback or capture fault
    #[error("recording failed: {0}")]
    RecordingFailed(String),

    /// Encoder produced no usable output
    #[error("encode failed: {0}")]
    Encode(String),

    /// Tag embedding failed
    #[error("tagging failed: {0}")]
    Tag(String),

    /// Copy to removable storage failed
    #[error("sync copy failed: {0}")]
    SyncCopyFailed(String),

    /// An external collaborator (messenger, discovery, probe) failed
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// The dispatcher is no longer accepting events
    #[error("orchestrator stopped")]
    Stopped,

    /// Track store or other shared infrastructure failure
    #[error(transparent)]
    Store(#[from] tapeloop_common::Error),
}

impl OrchestratorError {
    /// Failure to reach the durable track store ends the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Store(err) if err.is_database())
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Store(tapeloop_common::Error::Database(err))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Store(tapeloop_common::Error::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// HTTP API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict with current state (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Dispatcher is gone (503)
    #[error("Orchestrator unavailable")]
    Unavailable,

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::InvalidTransition(e) => ApiError::Conflict(e.to_string()),
            OrchestratorError::Store(tapeloop_common::Error::NotFound(what)) => {
                ApiError::NotFound(what)
            }
            OrchestratorError::Stopped => ApiError::Unavailable,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
