use std::collections::HashMap;

use amelia_core::error::AmeliaError;
use amelia_core::reducer::{reduce, StatePatch};
use amelia_core::{EventBus, Storage};
use amelia_types::{ExecutionState, HistoryEntry, Profile, WorkflowEvent, WorkflowStatus};
use chrono::Utc;
use serde_json::Value;

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::nodes::{self, DriverResolver, NodeContext};
use crate::routing::{self, GraphNode};

/// Owns one frontier cursor per workflow and advances it node-by-node via
/// `routing::route`, checkpointing after every transition and suspending
/// at `human_approval` until `approvals()` is resolved externally.
/// Grounded in the teacher's `OrchestratorEngine::run_execution_loop`
/// (`src-tauri/src/orchestrator/engine.rs`), generalized from a flat
/// task-queue loop to a six-node graph walk.
pub struct GraphEngine {
    storage: Storage,
    event_bus: EventBus,
    approvals: ApprovalGate,
    driver_resolver: DriverResolver,
}

impl GraphEngine {
    pub fn new(storage: Storage, event_bus: EventBus) -> Self {
        Self {
            storage,
            event_bus,
            approvals: ApprovalGate::new(),
            driver_resolver: nodes::production_driver_resolver(),
        }
    }

    /// Swaps in a different way of turning a resolved agent config into a
    /// `Driver`, for driving the whole node graph against a scripted test
    /// double instead of a real provider.
    pub fn with_driver_resolver(mut self, resolver: DriverResolver) -> Self {
        self.driver_resolver = resolver;
        self
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn run(
        &self,
        mut state: ExecutionState,
        profile: Profile,
    ) -> Result<ExecutionState, AmeliaError> {
        let cx = NodeContext {
            profile: profile.clone(),
            event_bus: self.event_bus.clone(),
            resolve_driver: self.driver_resolver.clone(),
        };
        let mut step_index = self
            .storage
            .load_latest_checkpoint(&state.workflow_id)
            .await
            .ok()
            .flatten()
            .map(|(step, _)| step)
            .unwrap_or(0);
        let mut current = GraphNode::Architect;

        loop {
            if matches!(current, GraphNode::End) {
                break;
            }

            let outcome = match current {
                GraphNode::Architect => nodes::architect_node(&state, &cx).await,
                GraphNode::PlanValidator => nodes::plan_validator_node(&state, &cx).await,
                GraphNode::HumanApproval => nodes::human_approval_node(&state, &cx).await,
                GraphNode::Developer => nodes::developer_node(&state, &cx).await,
                GraphNode::Reviewer => nodes::reviewer_node(&state, &cx).await,
                GraphNode::Evaluator => nodes::evaluator_node(&state, &cx).await,
                GraphNode::End => unreachable!("loop breaks before reaching End"),
            };

            let patch = match outcome {
                Ok(patch) => patch,
                Err(e) => {
                    state = self
                        .apply(&state, failure_patch(current, &e), &mut step_index)
                        .await?;
                    break;
                }
            };
            state = self.apply(&state, patch, &mut step_index).await?;

            if current == GraphNode::HumanApproval && state.human_approved.is_none() {
                let decision = self.approvals.wait_for(&state.workflow_id).await;
                self.approvals.clear(&state.workflow_id).await;
                state = self
                    .apply(&state, approval_patch(decision), &mut step_index)
                    .await?;
            }

            if state.workflow_status == WorkflowStatus::Failed {
                break;
            }

            current = routing::route(current, &state, &profile);
        }

        // Reaching `End` without an evaluator configured (§4.5's
        // `route_from_developer` returns `End` directly once the DAG is
        // finished) never touches `workflow_status` on its own — every
        // other exit from the loop above already set `Failed` or
        // `Completed`, so `Running` here means a clean finish.
        if state.workflow_status == WorkflowStatus::Running {
            state = self
                .apply(&state, completion_patch(), &mut step_index)
                .await?;
        }

        Ok(state)
    }

    async fn apply(
        &self,
        state: &ExecutionState,
        patch: StatePatch,
        step_index: &mut u64,
    ) -> Result<ExecutionState, AmeliaError> {
        let history_before = state.history.len();
        let next = reduce(state, patch)
            .map_err(|e| AmeliaError::ConcurrentWrite(e.0.to_string()))?;
        *step_index += 1;
        self.storage
            .save_checkpoint(&next.workflow_id, *step_index, &next)
            .await
            .map_err(|e| AmeliaError::Sandbox {
                operation: "save_checkpoint".to_string(),
                reason: e.to_string(),
            })?;

        // One persisted event per history entry a node appended this step,
        // plus a trailing `checkpoint_saved` marker — both feed the same
        // per-workflow sequence so reconnect-backfill (§4.6, §8 invariant 4)
        // sees every domain event, not just the generic step boundary.
        for entry in &next.history[history_before..] {
            let sequence = self
                .storage
                .next_sequence(&next.workflow_id)
                .await
                .map_err(|e| AmeliaError::Sandbox {
                    operation: "next_sequence".to_string(),
                    reason: e.to_string(),
                })?;
            let mut data = serde_json::Map::new();
            for (key, value) in &entry.detail {
                data.insert(key.clone(), value.clone());
            }
            let event = WorkflowEvent::new(
                next.workflow_id.clone(),
                sequence,
                entry.actor.clone(),
                entry.event.clone(),
                format!("{}: {}", entry.actor, entry.event),
                data,
            );
            self.storage
                .append_event(&event)
                .await
                .map_err(|e| AmeliaError::Sandbox {
                    operation: "append_event".to_string(),
                    reason: e.to_string(),
                })?;
            self.event_bus.emit(event);
        }

        let sequence = self
            .storage
            .next_sequence(&next.workflow_id)
            .await
            .map_err(|e| AmeliaError::Sandbox {
                operation: "next_sequence".to_string(),
                reason: e.to_string(),
            })?;
        let checkpoint_event = WorkflowEvent::new(
            next.workflow_id.clone(),
            sequence,
            "graph_engine",
            "checkpoint_saved",
            format!("step {step_index}"),
            serde_json::Map::new(),
        );
        self.storage
            .append_event(&checkpoint_event)
            .await
            .map_err(|e| AmeliaError::Sandbox {
                operation: "append_event".to_string(),
                reason: e.to_string(),
            })?;
        self.event_bus.emit(checkpoint_event);
        Ok(next)
    }
}

fn failure_patch(node: GraphNode, error: &AmeliaError) -> StatePatch {
    let mut patch = StatePatch::new();
    patch.workflow_status = Some(WorkflowStatus::Failed);
    let mut detail = HashMap::new();
    detail.insert("error".to_string(), Value::String(error.to_string()));
    patch.history.push(HistoryEntry {
        ts: Utc::now(),
        actor: node.as_str().to_string(),
        event: "node_failed".to_string(),
        detail,
    });
    patch
}

fn completion_patch() -> StatePatch {
    let mut patch = StatePatch::new();
    patch.workflow_status = Some(WorkflowStatus::Completed);
    patch.history.push(HistoryEntry {
        ts: Utc::now(),
        actor: "graph_engine".to_string(),
        event: "workflow_completed".to_string(),
        detail: HashMap::new(),
    });
    patch
}

fn approval_patch(decision: ApprovalDecision) -> StatePatch {
    let mut patch = StatePatch::new();
    let approved = matches!(decision, ApprovalDecision::Approved);
    patch.human_approved = Some(Some(approved));
    if !approved {
        patch.workflow_status = Some(WorkflowStatus::Failed);
    } else {
        patch.workflow_status = Some(WorkflowStatus::Running);
    }
    patch.history.push(HistoryEntry {
        ts: Utc::now(),
        actor: "human_approval".to_string(),
        event: if approved {
            "human_approved".to_string()
        } else {
            "human_rejected".to_string()
        },
        detail: HashMap::new(),
    });
    patch
}
