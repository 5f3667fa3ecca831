//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::expiration::ExpirationError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("file not found")]
    NotFound,
    #[error("file path is invalid")]
    PathInvalid,
    #[error("file already exists")]
    AlreadyExists,
    #[error("file size limit of {0} bytes exceeded")]
    SizeLimitExceeded(u64),
    #[error("expire time is invalid, must be between 1m and 720h")]
    InvalidExpireTime,
    #[error("token is required")]
    TokenRequired,
    #[error("token is invalid")]
    TokenInvalid,
    #[error("{0}")]
    BadRequest(String),
    #[error("range not satisfiable")]
    RangeNotSatisfiable(u64),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PathInvalid | ApiError::InvalidExpireTime | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::AlreadyExists => StatusCode::CONFLICT,
            ApiError::SizeLimitExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::TokenRequired => StatusCode::UNAUTHORIZED,
            ApiError::TokenInvalid => StatusCode::FORBIDDEN,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        let message = match &self {
            ApiError::Internal(detail) => {
                error!(error = %detail, "request failed");
                "internal server error".to_string()
            }
            ApiError::RangeNotSatisfiable(size) => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                self.to_string()
            }
            ApiError::TokenRequired => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                self.to_string()
            }
            other => other.to_string(),
        };
        (status, headers, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound => ApiError::NotFound,
            StorageError::PathInvalid | StorageError::IsDirectory => ApiError::PathInvalid,
            StorageError::SizeLimitExceeded { limit } => ApiError::SizeLimitExceeded(limit),
            StorageError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ExpirationError> for ApiError {
    fn from(error: ExpirationError) -> Self {
        match error {
            ExpirationError::OutOfRange => ApiError::InvalidExpireTime,
            other => ApiError::Internal(other.to_string()),
        }
    }
}
