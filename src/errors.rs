use crate::services::{object_store::StoreError, runner::RunnerError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures of the backup and restore pipelines.
///
/// Integrity failures carry both sides of the comparison so callers can log
/// or surface them without re-reading the store.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The stored manifest ETag differs from the checksum recorded at backup time.
    #[error("checksum of `{location}` is `{actual}`, expected `{expected}`")]
    IntegrityMismatch {
        location: String,
        expected: String,
        actual: String,
    },
    /// The download broke, or the restore tool consuming it exited badly.
    #[error("download of `{location}` failed: {reason}")]
    DownloadError { location: String, reason: String },
    #[error("segment `{segment}` etag `{etag}` does not match local checksum `{checksum}`")]
    SegmentEtagMismatch {
        segment: String,
        etag: String,
        checksum: String,
    },
    #[error("manifest `{manifest}` etag `{etag}` does not match local checksum `{checksum}`")]
    ManifestEtagMismatch {
        manifest: String,
        etag: String,
        checksum: String,
    },
    #[error("backup runner failed: {0}")]
    RunnerFailed(#[source] RunnerError),
    #[error("restore sink failed: {0}")]
    SinkFailed(#[source] RunnerError),
    #[error("invalid backup location `{0}`")]
    InvalidLocation(String),
    #[error("invalid restore chain: {0}")]
    RestoreChain(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::IntegrityMismatch { .. }
                | PipelineError::SegmentEtagMismatch { .. }
                | PipelineError::ManifestEtagMismatch { .. }
        )
    }
}

/// A lightweight wrapper for HTTP errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid X-Auth-Token")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::ContainerNotFound(_) | StoreError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::ServerIntegrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
