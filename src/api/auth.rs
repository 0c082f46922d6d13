//! Bearer-token authentication for job endpoints.
//!
//! The token comes from `Authorization: Bearer <token>` or the `x-api-key`
//! header. When no token is configured every request passes.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};

use super::{ApiError, AppState};

const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests that do not carry the configured API token.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let verdict = match presented_token(request.headers()) {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err(ApiError::Unauthorized("invalid API token".to_string())),
        None => Err(ApiError::Unauthorized("missing API token".to_string())),
    };

    if let Err(e) = verdict {
        tracing::warn!(path = %request.uri().path(), error = %e, "Rejected request");
        return Err(e);
    }
    Ok(next.run(request).await)
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
