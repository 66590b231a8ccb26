use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::driver::{DriverSession, HistoryEntry, Role};
use crate::ids::{ProfileID, TaskID, WorkflowID};
use crate::issue::{Design, Issue};
use crate::review::{PlanValidationResult, ReviewResult};
use crate::task::{TaskDAG, TaskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    AwaitingApproval,
}

/// The reducer record (§3.2). Fields annotated with a merge strategy in
/// the spec (`task_results`, `driver_sessions`, `history`,
/// `completed_steps`) are merged by `amelia_core::reducer::reduce`; every
/// other field is single-writer and a concurrent write is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub profile_id: ProfileID,
    pub workflow_id: WorkflowID,

    pub issue: Issue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<Design>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskDAG>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    #[serde(default)]
    pub task_results: HashMap<TaskID, TaskResult>,
    #[serde(default)]
    pub driver_sessions: HashMap<Role, DriverSession>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub completed_steps: HashSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review: Option<ReviewResult>,
    #[serde(default)]
    pub review_iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_validation_result: Option<PlanValidationResult>,
    #[serde(default)]
    pub plan_revision_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskID>,
    #[serde(default)]
    pub total_tasks: u32,
    #[serde(default)]
    pub current_task_index: u32,

    pub workflow_status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_approved: Option<bool>,
}

impl ExecutionState {
    pub fn init(workflow_id: WorkflowID, profile_id: ProfileID, issue: Issue) -> Self {
        Self {
            profile_id,
            workflow_id,
            issue,
            design: None,
            plan: None,
            plan_markdown: None,
            plan_path: None,
            goal: None,
            task_results: HashMap::new(),
            driver_sessions: HashMap::new(),
            history: Vec::new(),
            completed_steps: HashSet::new(),
            last_review: None,
            review_iteration: 0,
            plan_validation_result: None,
            plan_revision_count: 0,
            current_task_id: None,
            total_tasks: 0,
            current_task_index: 0,
            workflow_status: WorkflowStatus::Running,
            human_approved: None,
        }
    }

    /// §8 invariant 1: every plan task's derived status is one of the
    /// five `Status` variants (trivially true given the enum, but this
    /// makes the lookup — and the derivation rule from §3.2 — explicit).
    pub fn get_task_status(&self, task_id: &TaskID) -> Option<crate::ids::Status> {
        self.task_results.get(task_id).map(|r| r.status)
    }
}
