use std::collections::HashMap;
use std::sync::Arc;

use amelia_types::WorkflowID;
use tokio::sync::{watch, Mutex};

/// Resolution of a pending `human_approval` node, reported by whatever
/// surface prompts the human (`amelia-server`'s REST/WS handlers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Rejected,
}

/// Suspends `human_approval_node` until an external caller resolves it,
/// keyed per `workflow_id` so concurrent workflows never share a waiter.
/// Grounded in the teacher's `AppState::active_log_streams` id-keyed
/// waiter map (`src-tauri/src/state.rs`), generalized from a one-shot
/// stop signal to a `watch` channel so a node that starts waiting after
/// the decision already landed still observes it.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    waiters: Arc<Mutex<HashMap<WorkflowID, watch::Sender<ApprovalDecision>>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, workflow_id: &WorkflowID) -> watch::Sender<ApprovalDecision> {
        let mut waiters = self.waiters.lock().await;
        waiters
            .entry(workflow_id.clone())
            .or_insert_with(|| watch::channel(ApprovalDecision::Pending).0)
            .clone()
    }

    /// Blocks until `resolve` is called for this workflow, or the sender
    /// side is dropped (the channel closing without a decision is
    /// reported back as `Pending` rather than panicking).
    pub async fn wait_for(&self, workflow_id: &WorkflowID) -> ApprovalDecision {
        let tx = self.sender_for(workflow_id).await;
        let mut rx = tx.subscribe();
        loop {
            let current = rx.borrow().clone();
            if current != ApprovalDecision::Pending {
                return current;
            }
            if rx.changed().await.is_err() {
                return ApprovalDecision::Pending;
            }
        }
    }

    pub async fn resolve(&self, workflow_id: &WorkflowID, decision: ApprovalDecision) {
        let tx = self.sender_for(workflow_id).await;
        let _ = tx.send(decision);
    }

    /// Drops the waiter entry once a decision has been consumed, so a
    /// long-lived server process doesn't accumulate one entry per
    /// completed workflow forever.
    pub async fn clear(&self, workflow_id: &WorkflowID) {
        self.waiters.lock().await.remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_returns_immediately_once_already_resolved() {
        let gate = ApprovalGate::new();
        let workflow_id = WorkflowID::from("wf-1");
        gate.resolve(&workflow_id, ApprovalDecision::Approved).await;
        assert_eq!(gate.wait_for(&workflow_id).await, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn wait_for_unblocks_when_resolved_concurrently() {
        let gate = Arc::new(ApprovalGate::new());
        let workflow_id = WorkflowID::from("wf-2");

        let waiter_gate = gate.clone();
        let waiter_id = workflow_id.clone();
        let waiter = tokio::spawn(async move { waiter_gate.wait_for(&waiter_id).await });

        tokio::task::yield_now().await;
        gate.resolve(&workflow_id, ApprovalDecision::Rejected).await;

        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Rejected);
    }

    #[tokio::test]
    async fn clear_removes_the_waiter_entry() {
        let gate = ApprovalGate::new();
        let workflow_id = WorkflowID::from("wf-3");
        gate.resolve(&workflow_id, ApprovalDecision::Approved).await;
        gate.clear(&workflow_id).await;
        assert!(gate.waiters.lock().await.get(&workflow_id).is_none());
    }
}
