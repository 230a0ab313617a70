use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use tracing::debug;

use crate::{response::ApiError, token::Claims, AppState};

/// A validated `Authorization: Bearer <capability token>`.
#[derive(Debug, Clone)]
pub struct Capability(pub Claims);

impl FromRequestParts<AppState> for Capability {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::InvalidToken)?;

        match state.issuer.validate(token) {
            Ok(claims) => Ok(Capability(claims)),
            Err(e) => {
                debug!(reason = %e, "rejected capability token");
                Err(ApiError::InvalidToken)
            }
        }
    }
}
