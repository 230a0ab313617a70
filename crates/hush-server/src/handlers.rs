use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;
use tracing::{debug, info};

use crate::{
    auth::Capability,
    pow,
    response::{not_available, ApiError},
    store::GetOutcome,
    validation,
    wire::{BurnRequest, CreateRequest, CreateResponse, SecretResponse, TokenResponse},
    AppState,
};

/// Header a reader echoes back to retry a read without consuming a view.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Token ─────────────────────────────────────────────────────────────────────

pub async fn issue_token(State(state): State<AppState>) -> Result<Json<TokenResponse>, ApiError> {
    let issued = state.issuer.issue()?;
    Ok(Json(issued.into()))
}

// ── Create ────────────────────────────────────────────────────────────────────

pub async fn create_secret(
    State(state): State<AppState>,
    Capability(claims): Capability,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let Json(req) = body.map_err(|e| {
        debug!(status = %e.status(), "rejected create body");
        ApiError::Validation("request body is not a valid create request".into())
    })?;

    if !constant_time_eq(req.nonce.as_bytes(), claims.nonce.as_bytes()) {
        return Err(ApiError::InvalidToken);
    }
    if !pow::verify(&claims.nonce, req.pow_solution, &claims.challenge()) {
        return Err(ApiError::InvalidPow);
    }

    let secret = validation::new_secret(req)?;

    if state.single_use_tokens && !state.store.claim_nonce(&claims.nonce, claims.exp)? {
        debug!("capability nonce already spent");
        return Err(ApiError::InvalidToken);
    }

    let (ttl_secs, max_views) = (secret.ttl_secs, secret.max_views);
    let created = state.store.put(secret)?;
    info!(id = %created.id, ttl_secs, max_views, "audit: secret.create");

    Ok((StatusCode::CREATED, Json(created.into())))
}

// ── Get ───────────────────────────────────────────────────────────────────────

/// Prefix shared by every per-secret route.
const SECRET_PATH_PREFIX: &str = "/api/secrets/";

/// The path id, or an empty one when the extractor could not decode it. An
/// empty id is never well formed and takes the store's malformed-id lookup.
fn id_or_empty(id: Result<Path<String>, PathRejection>) -> String {
    match id {
        Ok(Path(id)) => id,
        Err(rejection) => {
            debug!(status = %rejection.status(), "undecodable secret id");
            String::new()
        }
    }
}

pub async fn get_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    id: Result<Path<String>, PathRejection>,
) -> Response {
    let id = id_or_empty(id);
    let access_token = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    read_secret(&state, &id, access_token)
}

fn read_secret(state: &AppState, id: &str, access_token: Option<&str>) -> Response {
    match state.store.get(id, access_token) {
        Ok(GetOutcome::Available(retrieved)) => (
            [(header::CACHE_CONTROL, "no-store")],
            Json(SecretResponse::from(retrieved)),
        )
            .into_response(),
        Ok(GetOutcome::NotAvailable) => not_available(),
        Err(e) => ApiError::Internal(e).into_response(),
    }
}

// ── Burn ──────────────────────────────────────────────────────────────────────

/// Always 204, whether or not anything was deleted.
pub async fn burn_secret(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<BurnRequest>, JsonRejection>,
) -> StatusCode {
    let id = id_or_empty(id);
    // An empty token never matches a stored burn token.
    let burn_token = body.map(|Json(req)| req.burn_token).unwrap_or_default();
    state.store.burn(&id, &burn_token);
    StatusCode::NO_CONTENT
}

// ── Fallback ──────────────────────────────────────────────────────────────────

/// Unrouted paths under `/api/secrets/` (empty ids, extra segments) answer
/// exactly like an unavailable secret or a silent burn.
pub async fn unmatched(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if !uri.path().starts_with(SECRET_PATH_PREFIX) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match method {
        Method::GET | Method::HEAD => read_secret(&state, "", None),
        Method::POST => {
            state.store.burn("", "");
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
