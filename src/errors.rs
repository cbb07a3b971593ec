use crate::services::storage::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
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

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
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

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotExist(_) => StatusCode::NOT_FOUND,
            StorageError::AlreadyExist(_) | StorageError::ContainerNotEmpty(_) => {
                StatusCode::CONFLICT
            }
            StorageError::BadChecksum { .. } => StatusCode::PRECONDITION_FAILED,
            StorageError::NotImplemented { .. } | StorageError::ThirdPartyNotEnabled { .. } => {
                StatusCode::NOT_IMPLEMENTED
            }
            StorageError::InvalidPath(_)
            | StorageError::InvalidChunkPath(_)
            | StorageError::UnsupportedChecksum(_)
            | StorageError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
            StorageError::DuplicateSelector(_) | StorageError::Io(_) => {
                tracing::error!("storage failure: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}
