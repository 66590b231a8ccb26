use std::collections::HashMap;

use amelia_core::error::AmeliaError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

/// What a sandboxed agent is allowed to reach once it has been resolved
/// from its `X-Amelia-Profile` header (§4.3). Kept separate from
/// `amelia_types::Profile` so the proxy never needs the full profile
/// shape, only the credentials it forwards.
#[derive(Debug, Clone)]
pub struct ProxyResolution {
    pub base_url: String,
    pub api_key: Option<String>,
    pub git_credential: Option<String>,
}

/// Resolves a profile name (lifted from the request header) to the
/// upstream credentials it should be forwarded with. Implemented by
/// `amelia-server` against the profile store; kept as a trait here so
/// this crate never depends on `amelia-core::config`'s filesystem layer.
#[async_trait]
pub trait ResolveProvider: Send + Sync {
    async fn resolve(&self, profile_name: &str) -> Result<ProxyResolution, AmeliaError>;
}

#[derive(Debug, Deserialize)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

/// Forwards a chat/completions-shaped request to the resolved profile's
/// API, the same request shape `ApiDriver::generate` sends directly
/// (§4.2, §4.3) — the proxy exists so a sandboxed container driver can
/// reach the same upstream without holding the API key itself.
pub async fn forward_chat_completions(
    client: &Client,
    resolution: &ProxyResolution,
    body: Value,
) -> Result<UpstreamResponse, AmeliaError> {
    forward_json(client, resolution, "/messages", body).await
}

pub async fn forward_embeddings(
    client: &Client,
    resolution: &ProxyResolution,
    body: Value,
) -> Result<UpstreamResponse, AmeliaError> {
    forward_json(client, resolution, "/embeddings", body).await
}

async fn forward_json(
    client: &Client,
    resolution: &ProxyResolution,
    path: &str,
    body: Value,
) -> Result<UpstreamResponse, AmeliaError> {
    let mut req = client
        .post(format!("{}{path}", resolution.base_url))
        .header("anthropic-version", "2023-06-01")
        .json(&body);
    if let Some(key) = &resolution.api_key {
        req = req.header("x-api-key", key);
    }

    let response = req.send().await.map_err(|e| AmeliaError::TransientProvider {
        provider: "proxy".to_string(),
        reason: e.to_string(),
    })?;
    let status = response.status().as_u16();
    let body = response.json().await.map_err(|e| AmeliaError::TransientProvider {
        provider: "proxy".to_string(),
        reason: e.to_string(),
    })?;

    Ok(UpstreamResponse { status, body })
}

/// `git` credential helper output for a sandboxed clone/push, so the
/// sandbox never sees the long-lived token directly — it asks the proxy
/// for a credential scoped to the current workflow's profile (§4.3).
pub fn git_credential_response(resolution: &ProxyResolution, host: &str) -> Option<HashMap<String, String>> {
    let token = resolution.git_credential.as_ref()?;
    let mut out = HashMap::new();
    out.insert("protocol".to_string(), "https".to_string());
    out.insert("host".to_string(), host.to_string());
    out.insert("username".to_string(), "amelia".to_string());
    out.insert("password".to_string(), token.clone());
    Some(out)
}
