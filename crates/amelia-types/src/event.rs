use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::WorkflowID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDomain {
    Workflow,
    Brainstorm,
    Oracle,
    Knowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Debug,
    Error,
}

/// `(workflow_id, sequence)` is globally unique; `sequence` is monotonic
/// per `workflow_id` with no gaps (§3.3, §8 invariant 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub domain: EventDomain,
    pub workflow_id: WorkflowID,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl WorkflowEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_id: WorkflowID,
        sequence: u64,
        agent: impl Into<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: EventDomain::Workflow,
            workflow_id,
            sequence,
            timestamp: Utc::now(),
            agent: agent.into(),
            event_type: event_type.into(),
            level: None,
            message: message.into(),
            data,
            correlation_id: None,
        }
    }
}
