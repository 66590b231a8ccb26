pub mod auth;
pub mod error;
pub mod pairing;
pub mod proxy;
pub mod rate_limit;
pub mod workflows;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use amelia_core::config::ProfileStore;
use amelia_core::{EventBus, Storage};
use amelia_graph::GraphEngine;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::proxy::EnvProxyResolver;
use crate::rate_limit::RateLimiter;
use crate::ws::ConnectionManager;

/// Shared handler state, grounded in the teacher's `AppState` (it bundles
/// every cross-cutting dependency a handler might need rather than
/// threading each one through separately), trimmed to what the workflow /
/// pairing / proxy surface actually touches.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub event_bus: EventBus,
    pub engine: Arc<GraphEngine>,
    pub profiles: Arc<ProfileStore>,
    pub proxy_resolver: Arc<EnvProxyResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub connections: ConnectionManager,
    pub http_client: reqwest::Client,
    pub server_name: String,
}

impl AppState {
    pub fn new(storage: Storage, profiles: Arc<ProfileStore>, server_name: String) -> Self {
        let event_bus = EventBus::new();
        let engine = Arc::new(GraphEngine::new(storage.clone(), event_bus.clone()));
        let proxy_resolver = Arc::new(EnvProxyResolver {
            profiles: profiles.clone(),
        });
        Self {
            storage,
            event_bus,
            engine,
            profiles,
            proxy_resolver,
            rate_limiter: Arc::new(RateLimiter::new()),
            connections: ConnectionManager::new(),
            http_client: reqwest::Client::new(),
            server_name,
        }
    }
}

/// Builds the full route table of §6.1/§6.2, with permissive CORS grounded
/// in the teacher's `CorsLayer::new().allow_origin(Any)` setup
/// (`src-tauri/src/http.rs`) — this server is consumed by a paired mobile
/// client, not a same-origin web app, so origin restriction is not
/// meaningful here.
pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workflows", post(workflows::create))
        .route("/api/workflows/{id}", get(workflows::get))
        .route("/api/workflows/{id}/approve", post(workflows::approve))
        .route("/api/workflows/{id}/reject", post(workflows::reject))
        .route("/api/pair/generate", post(pairing::generate))
        .route("/api/pair/exchange", post(pairing::exchange))
        .route("/api/pair/devices", get(pairing::list_devices))
        .route("/api/pair/devices/{id}", delete(pairing::revoke_device))
        .route("/proxy/v1/chat/completions", post(proxy::chat_completions))
        .route("/proxy/v1/embeddings", post(proxy::embeddings))
        .route("/proxy/v1/git/credentials", post(proxy::git_credentials))
        .route("/ws/events", get(ws::events))
        .layer(cors)
        .with_state(state)
}

/// Periodic retention sweep for events (§4.7) and expired pairing tokens
/// (§4.7), run as a background task the way the teacher runs its
/// `run_status_indexer`/`run_routine_scheduler` loops — an interval tick
/// rather than a cron dependency, since the sweep cadence here is measured
/// in hours, not wall-clock calendar schedules.
pub async fn run_retention_sweep(storage: Storage) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        let older_than = chrono::Utc::now() - chrono::Duration::days(30);
        match storage.sweep_events(older_than, Some(10_000)).await {
            Ok(removed) if removed > 0 => tracing::info!(removed, "swept retained events"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "event sweep failed"),
        }
        match storage.sweep_expired_pairing_tokens().await {
            Ok(removed) if removed > 0 => tracing::info!(removed, "swept expired pairing tokens"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "pairing token sweep failed"),
        }
    }
}

/// Grounded in the teacher's own `axum::serve(...).with_graceful_shutdown(..)`
/// wiring (`tandem-server::http.rs`): wait on ctrl-c, then let every
/// in-flight task finish instead of dropping the listener out from under
/// them. Extended here to also close every live `/ws/events` connection
/// with code 1001 once the listener itself has stopped accepting.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let sweep_storage = state.storage.clone();
    tokio::spawn(run_retention_sweep(sweep_storage));

    let connections = state.connections.clone();
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "amelia-server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
        connections.shutdown_all().await;
    })
    .await?;
    Ok(())
}
