use amelia_core::error::AmeliaError;
use amelia_drivers::sandbox::proxy::{
    forward_chat_completions, forward_embeddings, git_credential_response, ProxyResolution,
    ResolveProvider,
};
use amelia_core::config::ProfileStore;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::AppState;

/// Resolves a profile name to upstream proxy credentials from the profile
/// store (§4.3, §6.1). Credentials themselves live in the server's
/// environment rather than the profile file — profiles name a model, not a
/// secret — so this only validates that the named profile exists before
/// handing back the process-wide upstream config.
pub struct EnvProxyResolver {
    pub profiles: std::sync::Arc<ProfileStore>,
}

#[async_trait]
impl ResolveProvider for EnvProxyResolver {
    async fn resolve(&self, profile_name: &str) -> Result<ProxyResolution, AmeliaError> {
        self.profiles
            .load(profile_name)
            .await
            .map_err(|_| AmeliaError::Auth(format!("unknown profile `{profile_name}`")))?;

        Ok(ProxyResolution {
            base_url: std::env::var("AMELIA_UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            git_credential: std::env::var("AMELIA_GIT_TOKEN").ok(),
        })
    }
}

fn profile_header(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-amelia-profile")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::Amelia(AmeliaError::Auth("missing X-Amelia-Profile header".into()))
        })
}

fn upstream_into_response(status: u16, body: Value) -> impl IntoResponse {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(body))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let profile_name = profile_header(&headers)?;
    let resolution = state.proxy_resolver.resolve(&profile_name).await?;
    let upstream = forward_chat_completions(&state.http_client, &resolution, body).await?;
    Ok(upstream_into_response(upstream.status, upstream.body))
}

pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let profile_name = profile_header(&headers)?;
    let resolution = state.proxy_resolver.resolve(&profile_name).await?;
    let upstream = forward_embeddings(&state.http_client, &resolution, body).await?;
    Ok(upstream_into_response(upstream.status, upstream.body))
}

#[derive(Deserialize)]
pub struct GitCredentialRequest {
    host: String,
}

pub async fn git_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GitCredentialRequest>,
) -> Result<Json<Value>, ApiError> {
    let profile_name = profile_header(&headers)?;
    let resolution = state.proxy_resolver.resolve(&profile_name).await?;
    match git_credential_response(&resolution, &req.host) {
        Some(creds) => Ok(Json(serde_json::to_value(creds).unwrap())),
        None => Err(ApiError::NotFound),
    }
}
