use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::async_trait;
use amelia_core::error::AmeliaError;
use amelia_types::PairedDevice;

use crate::error::ApiError;
use crate::AppState;

/// Extracts the paired device identified by a `Bearer` device token,
/// rejecting with `401` if the header is missing, the token is unknown, or
/// the device has been revoked (§4.7, §8 invariant 6). Grounded in the
/// teacher's `api_token` bearer check in its router middleware, generalized
/// from a single shared token to one token per paired device.
pub struct AuthedDevice(pub PairedDevice);

#[async_trait]
impl FromRequestParts<AppState> for AuthedDevice {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Amelia(AmeliaError::Auth("missing Authorization header".into())))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Amelia(AmeliaError::Auth("expected a Bearer token".into())))?;

        let device = state
            .storage
            .find_device_by_token(token)
            .await
            .map_err(|e| {
                ApiError::Amelia(AmeliaError::Sandbox {
                    operation: "storage".to_string(),
                    reason: e.to_string(),
                })
            })?
            .ok_or_else(|| ApiError::Amelia(AmeliaError::Auth("unknown device token".into())))?;

        if device.is_revoked() {
            return Err(ApiError::Amelia(AmeliaError::Auth("device has been revoked".into())));
        }

        Ok(AuthedDevice(device))
    }
}
