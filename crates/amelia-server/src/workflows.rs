use std::sync::Arc;

use amelia_core::error::AmeliaError;
use amelia_graph::ApprovalDecision;
use amelia_types::{ExecutionState, Issue, ProfileID, WorkflowID, WorkflowStatus};
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthedDevice;
use crate::error::ApiError;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    issue: Issue,
    profile_id: String,
}

#[derive(Serialize)]
pub struct CreateWorkflowResponse {
    workflow_id: WorkflowID,
}

/// Starts a new workflow and returns immediately; the graph runs to
/// completion (or suspension at `human_approval`) on a detached task,
/// progress observable via `GET /api/workflows/{id}` or `/ws/events`
/// (§4.1, §6.1).
pub async fn create(
    State(state): State<AppState>,
    _authed: AuthedDevice,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<Json<CreateWorkflowResponse>, ApiError> {
    let profile = state
        .profiles
        .load(&req.profile_id)
        .await
        .map_err(|e| ApiError::Amelia(AmeliaError::Auth(e.to_string())))?;

    let workflow_id = WorkflowID::new();
    let execution_state =
        ExecutionState::init(workflow_id.clone(), ProfileID::from(req.profile_id), req.issue);

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.run(execution_state, profile).await {
            tracing::error!(error = %e, "workflow run ended in error");
        }
    });

    Ok(Json(CreateWorkflowResponse { workflow_id }))
}

pub async fn get(
    State(state): State<AppState>,
    _authed: AuthedDevice,
    Path(id): Path<String>,
) -> Result<Json<ExecutionState>, ApiError> {
    let workflow_id = WorkflowID::from(id);
    match state.storage.load_latest_checkpoint(&workflow_id).await? {
        Some((_, execution_state)) => Ok(Json(execution_state)),
        None => Err(ApiError::NotFound),
    }
}

async fn resolve_approval(
    state: &AppState,
    workflow_id: WorkflowID,
    decision: ApprovalDecision,
) -> Result<(), ApiError> {
    let Some((_, execution_state)) = state.storage.load_latest_checkpoint(&workflow_id).await?
    else {
        return Err(ApiError::NotFound);
    };
    if execution_state.workflow_status != WorkflowStatus::AwaitingApproval {
        return Err(ApiError::Conflict(
            "workflow is not awaiting approval".to_string(),
        ));
    }
    state.engine.approvals().resolve(&workflow_id, decision).await;
    Ok(())
}

pub async fn approve(
    State(state): State<AppState>,
    _authed: AuthedDevice,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    resolve_approval(&state, WorkflowID::from(id), ApprovalDecision::Approved).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn reject(
    State(state): State<AppState>,
    _authed: AuthedDevice,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    resolve_approval(&state, WorkflowID::from(id), ApprovalDecision::Rejected).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
