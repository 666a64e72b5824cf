//! Error types for the detonation engine

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Why a detonation run stopped before reaching `complete`
#[derive(Debug, Error)]
pub enum RunFailure {
    /// A hard-gating step failed; the message is already user-facing
    #[error("{message}")]
    Step { step: u8, message: String },

    /// Anything the pipeline did not anticipate (I/O on the host, a panic, ...)
    #[error("An unexpected server error occurred: {0}")]
    Internal(String),
}

impl RunFailure {
    pub fn step(step: u8, message: impl Into<String>) -> Self {
        RunFailure::Step {
            step,
            message: message.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        RunFailure::Internal(err.to_string())
    }
}

impl From<std::io::Error> for RunFailure {
    fn from(err: std::io::Error) -> Self {
        RunFailure::internal(err)
    }
}

/// Errors raised while browsing the durable results store
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Directory not found")]
    RunNotFound(String),

    #[error("File not found")]
    FileNotFound(PathBuf),

    #[error("Invalid file path")]
    InvalidPath(String),

    #[error("Only JSON files supported")]
    UnsupportedType(String),

    #[error("Invalid JSON file")]
    Parse { message: String },

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Upload(#[from] MultipartError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Report(err) => match err {
                ReportError::RunNotFound(_) => {
                    (StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
                }
                ReportError::FileNotFound(_) => {
                    (StatusCode::NOT_FOUND, json!({ "error": err.to_string() }))
                }
                ReportError::InvalidPath(_) | ReportError::UnsupportedType(_) => {
                    (StatusCode::BAD_REQUEST, json!({ "error": err.to_string() }))
                }
                ReportError::Parse { ref message } => (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": err.to_string(), "message": message }),
                ),
                ReportError::Io(ref e) => {
                    tracing::error!("Report store I/O failure: {}", e);
                    (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": err.to_string() }))
                }
            },
            // Oversized bodies surface here as 413
            ApiError::Upload(err) => (err.status(), json!({ "error": err.body_text() })),
        };

        (status, Json(body)).into_response()
    }
}
