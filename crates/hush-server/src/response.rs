use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::wire::ErrorBody;

/// The body every unavailable secret answers with.
pub const NOT_AVAILABLE_BODY: &str = r#"{"error":"not_available"}"#;

/// Byte-identical 404 for missing, expired, consumed, burned and malformed ids.
pub fn not_available() -> Response {
    (
        StatusCode::NOT_FOUND,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        NOT_AVAILABLE_BODY,
    )
        .into_response()
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid capability token")]
    InvalidToken,
    #[error("proof of work does not satisfy the challenge")]
    InvalidPow,
    #[error("not available")]
    NotAvailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::InvalidPow => StatusCode::FORBIDDEN,
            ApiError::NotAvailable => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "invalid_request",
            ApiError::InvalidToken => "invalid_token",
            ApiError::InvalidPow => "invalid_pow",
            ApiError::NotAvailable => "not_available",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::NotAvailable => return not_available(),
            ApiError::Internal(e) => {
                error!(error = %e, "internal error");
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.code().to_owned(),
            message: Some(message),
        };
        (self.status(), Json(body)).into_response()
    }
}
