use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::detect::config::ConfigError;
use crate::detect::DetectError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("pipeline unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Map an application error, surfacing configuration and detection
    /// errors as client errors.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ConfigError>() {
            return ApiError::BadRequest(e.to_string());
        }
        if let Some(e) = err.downcast_ref::<DetectError>() {
            return ApiError::BadRequest(e.to_string());
        }
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string(), "code": code }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
