use amelia_core::error::AmeliaError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Maps the error taxonomy of §7 (plus a few HTTP-only concerns —
/// missing resource, rate limiting, single-use token reuse) onto the
/// status codes of §6.1 via one shared `IntoResponse` impl, the way the
/// teacher centralizes status mapping rather than scattering
/// `StatusCode` literals through every handler.
pub enum ApiError {
    Amelia(AmeliaError),
    BadRequest(String),
    NotFound,
    Conflict(String),
    TokenExpired,
    RateLimited,
}

impl From<AmeliaError> for ApiError {
    fn from(error: AmeliaError) -> Self {
        ApiError::Amelia(error)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        // Storage/db failures bubble up as `anyhow::Error`, not a
        // knowledge-ingestion failure — `Sandbox` is the closest existing
        // kind for "an environment operation failed" and maps to 500
        // rather than `Ingestion`'s 400.
        ApiError::Amelia(AmeliaError::Sandbox {
            operation: "storage".to_string(),
            reason: error.to_string(),
        })
    }
}

fn status_for_amelia(error: &AmeliaError) -> StatusCode {
    match error {
        AmeliaError::Auth(_) => StatusCode::UNAUTHORIZED,
        AmeliaError::SchemaValidation { .. } => StatusCode::BAD_REQUEST,
        AmeliaError::Ingestion(_) => StatusCode::BAD_REQUEST,
        AmeliaError::ConcurrentWrite(_) => StatusCode::CONFLICT,
        AmeliaError::Sandbox { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        AmeliaError::TransientProvider { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::Amelia(e) => (status_for_amelia(e), e.kind(), e.to_string()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "not found".to_string()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.clone()),
            ApiError::TokenExpired => (
                StatusCode::GONE,
                "token_expired",
                "token already used or expired".to_string(),
            ),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate limit exceeded".to_string(),
            ),
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}
