use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use amelia_core::error::AmeliaError;
use amelia_types::{WorkflowEvent, WorkflowID};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

enum ControlMessage {
    Shutdown,
}

/// The connection-manager half of §4.6: a mutex-protected registry of
/// every live `/ws/events` connection, touched only to register/unregister
/// a connection or to fan a shutdown signal out to all of them — the
/// per-connection `workflow_id` filter set itself lives on the connection's
/// own task, never shared, so the registry's critical sections stay short.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<ControlMessage>>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.connections.lock().await.insert(id, tx);
        (id, rx)
    }

    async fn unregister(&self, id: Uuid) {
        self.connections.lock().await.remove(&id);
    }

    /// Closes every live connection with code 1001 ("shutting down");
    /// pending broadcasts are dropped (§4.6).
    pub async fn shutdown_all(&self) {
        let connections = self.connections.lock().await;
        for tx in connections.values() {
            let _ = tx.send(ControlMessage::Shutdown);
        }
    }
}

#[derive(Deserialize)]
pub struct EventsQuery {
    since: Option<String>,
    device_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { workflow_id: String },
    Unsubscribe { workflow_id: String },
    SubscribeAll,
    Pong,
}

/// Upgrades to the shared event stream, grounded in the teacher's
/// `pty_ws`/`pty_ws_stream` handler pair (`src-tauri/src/http.rs`): the
/// upgrade function stays a thin shim and a dedicated per-connection task
/// owns the socket. `?since=<event_id>` replays the backfill before
/// switching to live delivery (§4.6); device auth travels as a query
/// parameter rather than a header since browser `WebSocket` cannot set
/// custom headers on the upgrade request.
pub async fn events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let device = match &query.device_token {
        Some(token) => state.storage.find_device_by_token(token).await?,
        None => None,
    };
    let authed = device.map(|d| !d.is_revoked()).unwrap_or(false);
    if !authed {
        return Err(ApiError::Amelia(AmeliaError::Auth(
            "missing or invalid device_token".to_string(),
        )));
    }

    Ok(ws
        .on_upgrade(move |socket| stream_events(socket, state, query.since))
        .into_response())
}

fn passes_filter(filter: &HashSet<WorkflowID>, event: &WorkflowEvent) -> bool {
    filter.is_empty() || filter.contains(&event.workflow_id)
}

async fn stream_events(mut socket: WebSocket, state: AppState, since: Option<String>) {
    // Subscribed before backfill runs so nothing emitted while backfill is
    // in flight is missed; anything the broadcast already has queued by the
    // time backfill finishes is flushed after `backfill_complete`, per
    // §4.6's ordering guarantee.
    let mut rx = state.event_bus.subscribe();

    // Empty set = subscribe-all (§4.6), the connection's starting state
    // until the client narrows it with `subscribe`/`unsubscribe`.
    let mut filter: HashSet<WorkflowID> = HashSet::new();

    if let Some(event_id) = since {
        match state.storage.find_event_by_id(&event_id).await {
            Ok(Some(anchor)) => {
                match state
                    .storage
                    .events_after(&anchor.workflow_id, anchor.sequence)
                    .await
                {
                    Ok(events) => {
                        let count = events.len();
                        for event in &events {
                            if send_event(&mut socket, event).await.is_err() {
                                return;
                            }
                        }
                        if send_control(&mut socket, "backfill_complete", json!({ "count": count }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "backfill query failed");
                        let _ = socket.close().await;
                        return;
                    }
                }
            }
            Ok(None) => {
                if send_control(&mut socket, "backfill_expired", json!({ "message": "event not found, live stream only" }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "backfill lookup failed");
            }
        }
    }

    let mut queued_live = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => queued_live.push(event),
            Err(_) => break,
        }
    }
    for event in &queued_live {
        if passes_filter(&filter, event) && send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    let (conn_id, mut control_rx) = state.connections.register().await;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if send_control(&mut socket, "ping", json!({})).await.is_err() {
                    break;
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(ControlMessage::Shutdown) | None => {
                        let frame = CloseFrame {
                            code: 1001,
                            reason: "shutting down".into(),
                        };
                        let _ = socket.send(WsMessage::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { workflow_id }) => {
                                filter.insert(WorkflowID::from(workflow_id));
                            }
                            Ok(ClientFrame::Unsubscribe { workflow_id }) => {
                                filter.remove(&WorkflowID::from(workflow_id));
                            }
                            Ok(ClientFrame::SubscribeAll) => {
                                filter.clear();
                            }
                            // A missed pong window never forces a close on its
                            // own (§4.6) — the field exists for operational
                            // observability, so there is nothing to act on.
                            Ok(ClientFrame::Pong) => {}
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed client frame");
                            }
                        }
                    }
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) if passes_filter(&filter, &event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.connections.unregister(conn_id).await;
}

async fn send_event(socket: &mut WebSocket, event: &WorkflowEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    socket.send(WsMessage::Text(payload.into())).await
}

async fn send_control(
    socket: &mut WebSocket,
    kind: &str,
    extra: serde_json::Value,
) -> Result<(), axum::Error> {
    let mut payload = serde_json::Map::new();
    payload.insert("type".to_string(), json!(kind));
    if let Some(map) = extra.as_object() {
        for (k, v) in map {
            payload.insert(k.clone(), v.clone());
        }
    }
    socket
        .send(WsMessage::Text(
            serde_json::Value::Object(payload).to_string().into(),
        ))
        .await
}
