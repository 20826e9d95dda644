use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::security::token_manager::TokenError;

pub const CODE_OK: i32 = 0;
pub const CODE_ERROR: i32 = 7;
pub const CODE_INTERNAL: i32 = 1000;
pub const CODE_UNAUTHORIZED: i32 = 1003;
pub const CODE_FORBIDDEN: i32 = 1004;

/// Success envelope: `{"code": 0, "data": ..., "msg": "ok"}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub data: T,
    pub msg: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            data,
            msg: "ok".to_string(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Error message attached to error responses so outer layers can record it.
#[derive(Debug, Clone)]
pub struct ErrorSummary(pub String);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("too many requests")]
    RateLimited,
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, i32) {
        match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, CODE_UNAUTHORIZED),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, CODE_FORBIDDEN),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, CODE_ERROR),
            AppError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, CODE_ERROR),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, CODE_ERROR),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, CODE_ERROR),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Signing(_) | TokenError::Store(_) => AppError::Internal(err.to_string()),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let msg = self.to_string();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %msg, "request failed");
        }
        let mut response = (status, Json(json!({ "code": code, "msg": msg }))).into_response();
        response.extensions_mut().insert(ErrorSummary(msg));
        response
    }
}
