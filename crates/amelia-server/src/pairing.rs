use std::net::SocketAddr;

use amelia_core::error::AmeliaError;
use amelia_types::{DeviceID, PairedDevice, PairingToken};
use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::auth::AuthedDevice;
use crate::error::ApiError;
use crate::AppState;

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

#[derive(Serialize)]
pub struct PairGenerateResponse {
    pair_token: String,
    qr_url: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Issues a single-use, 60s-TTL pairing token (§4.7, §6.1). Rate-limited
/// to 5/min per caller IP — the bootstrap step for device pairing has no
/// existing auth to lean on, so it is the one route a caller could hammer
/// unauthenticated.
pub async fn generate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<PairGenerateResponse>, ApiError> {
    if !state.rate_limiter.check(addr.ip(), "pair_generate", 5).await {
        return Err(ApiError::RateLimited);
    }

    let pair_token = random_token();
    let token_hash = hash_token(&pair_token);
    let expires_at = Utc::now() + Duration::seconds(PairingToken::TTL_SECONDS);

    state
        .storage
        .put_pairing_token(&PairingToken {
            token_hash,
            expires_at,
            used_at: None,
            used_by_device_id: None,
        })
        .await?;

    Ok(Json(PairGenerateResponse {
        qr_url: format!("amelia://pair?token={pair_token}"),
        pair_token,
        expires_at,
    }))
}

#[derive(Deserialize)]
pub struct PairExchangeRequest {
    pair_token: String,
    device_name: String,
    #[serde(default)]
    device_model: Option<String>,
}

#[derive(Serialize)]
pub struct PairExchangeResponse {
    device_token: String,
    device_id: DeviceID,
    server_name: String,
}

/// Consumes a pairing token and mints a device token (§4.7, §6.1). The
/// token is consumed before the device record is written, so a race on the
/// same pairing token never leaves two devices behind — only the winner of
/// `consume_pairing_token` gets to call `put_device`.
pub async fn exchange(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<PairExchangeRequest>,
) -> Result<Json<PairExchangeResponse>, ApiError> {
    if !state.rate_limiter.check(addr.ip(), "pair_exchange", 10).await {
        return Err(ApiError::RateLimited);
    }

    let token_hash = hash_token(&req.pair_token);
    let device_id = DeviceID::new();

    let consumed = state
        .storage
        .consume_pairing_token(&token_hash, &device_id)
        .await?;
    if !consumed {
        return Err(ApiError::TokenExpired);
    }

    let device_token = random_token();
    let device_token_hash = bcrypt::hash(&device_token, bcrypt::DEFAULT_COST).map_err(|e| {
        ApiError::Amelia(AmeliaError::Sandbox {
            operation: "hash_device_token".to_string(),
            reason: e.to_string(),
        })
    })?;
    let device = PairedDevice {
        id: device_id.clone(),
        device_name: req.device_name,
        device_model: req.device_model,
        paired_at: Utc::now(),
        last_seen: None,
        revoked_at: None,
    };
    state.storage.put_device(&device, &device_token_hash).await?;

    Ok(Json(PairExchangeResponse {
        device_token,
        device_id,
        server_name: state.server_name.clone(),
    }))
}

pub async fn list_devices(
    State(state): State<AppState>,
    _authed: AuthedDevice,
) -> Result<Json<Vec<PairedDevice>>, ApiError> {
    let devices = state.storage.list_devices().await?;
    Ok(Json(devices))
}

pub async fn revoke_device(
    State(state): State<AppState>,
    _authed: AuthedDevice,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revoked = state.storage.revoke_device(&DeviceID::from(id)).await?;
    if revoked {
        Ok(Json(json!({ "revoked": true })))
    } else {
        Err(ApiError::NotFound)
    }
}
