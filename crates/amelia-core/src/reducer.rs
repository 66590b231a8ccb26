use std::collections::{HashMap, HashSet};

use amelia_types::{
    DriverSession, ExecutionState, HistoryEntry, PlanValidationResult, ProfileID, ReviewResult,
    Role, TaskDAG, TaskID, TaskResult, WorkflowStatus,
};
use thiserror::Error;

/// A node's return value: only the keys it actually wrote are `Some`.
/// Mirrors the teacher's partial-dict-merge shape
/// (`tandem-orchestrator::reducer::DefaultMissionReducer::reduce`)
/// generalized from a single mutable field to the full `ExecutionState`
/// and made exhaustive/compiler-checked rather than stringly keyed, per
/// the tightening described in SPEC_FULL.md §4.1.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub design: Option<Option<amelia_types::Design>>,
    pub plan: Option<Option<TaskDAG>>,
    pub plan_markdown: Option<Option<String>>,
    pub plan_path: Option<Option<String>>,
    pub goal: Option<Option<String>>,

    pub task_results: HashMap<TaskID, TaskResult>,
    pub driver_sessions: HashMap<Role, DriverSession>,
    pub history: Vec<HistoryEntry>,
    pub completed_steps: HashSet<String>,

    pub last_review: Option<Option<ReviewResult>>,
    pub review_iteration: Option<u32>,
    pub plan_validation_result: Option<Option<PlanValidationResult>>,
    pub plan_revision_count: Option<u32>,

    pub current_task_id: Option<Option<TaskID>>,
    pub total_tasks: Option<u32>,
    pub current_task_index: Option<u32>,

    pub workflow_status: Option<WorkflowStatus>,
    pub human_approved: Option<Option<bool>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("concurrent write to single-writer field `{0}`")]
pub struct ConcurrentWriteError(pub &'static str);

/// Merges a node's partial output into the next `ExecutionState` snapshot.
/// Total over well-typed inputs; annotated fields use `dict_merge` /
/// `set_union` / `list_append`, everything else is single-writer and a
/// second non-default write is rejected (§4.1).
///
/// Value construction (e.g. `TaskDAG::new`) already rejects invalid plans,
/// so `reduce` itself never needs to re-validate the DAG (§4.1, §9).
pub fn reduce(
    current: &ExecutionState,
    patch: StatePatch,
) -> Result<ExecutionState, ConcurrentWriteError> {
    let mut next = current.clone();

    single_writer("design", &mut next.design, patch.design)?;
    single_writer("plan", &mut next.plan, patch.plan)?;
    single_writer("plan_markdown", &mut next.plan_markdown, patch.plan_markdown)?;
    single_writer("plan_path", &mut next.plan_path, patch.plan_path)?;
    single_writer("goal", &mut next.goal, patch.goal)?;
    single_writer("last_review", &mut next.last_review, patch.last_review)?;
    single_writer(
        "plan_validation_result",
        &mut next.plan_validation_result,
        patch.plan_validation_result,
    )?;
    single_writer(
        "current_task_id",
        &mut next.current_task_id,
        patch.current_task_id,
    )?;
    single_writer("human_approved", &mut next.human_approved, patch.human_approved)?;

    if let Some(value) = patch.review_iteration {
        single_writer_scalar("review_iteration", &mut next.review_iteration, value)?;
    }
    if let Some(value) = patch.plan_revision_count {
        single_writer_scalar(
            "plan_revision_count",
            &mut next.plan_revision_count,
            value,
        )?;
    }
    if let Some(value) = patch.total_tasks {
        single_writer_scalar("total_tasks", &mut next.total_tasks, value)?;
    }
    if let Some(value) = patch.current_task_index {
        single_writer_scalar(
            "current_task_index",
            &mut next.current_task_index,
            value,
        )?;
    }
    if let Some(value) = patch.workflow_status {
        next.workflow_status = value;
    }

    // dict_merge: right-wins key-by-key, neither side mutated in place.
    for (id, result) in patch.task_results {
        next.task_results.insert(id, result);
    }
    for (role, session) in patch.driver_sessions {
        next.driver_sessions.insert(role, session);
    }
    // list_append: left then right.
    next.history.extend(patch.history);
    // set_union.
    next.completed_steps.extend(patch.completed_steps);

    Ok(next)
}

fn single_writer<T>(
    field: &'static str,
    current: &mut Option<T>,
    incoming: Option<Option<T>>,
) -> Result<(), ConcurrentWriteError> {
    let Some(incoming) = incoming else {
        return Ok(());
    };
    if current.is_some() && incoming.is_some() {
        return Err(ConcurrentWriteError(field));
    }
    *current = incoming;
    Ok(())
}

fn single_writer_scalar(
    field: &'static str,
    current: &mut u32,
    incoming: u32,
) -> Result<(), ConcurrentWriteError> {
    if *current != 0 && incoming != 0 && *current != incoming {
        return Err(ConcurrentWriteError(field));
    }
    *current = incoming;
    Ok(())
}

/// Merges two partials produced within the same node batch before either
/// is reduced, so `reduce(reduce(s,a),b) == reduce(s, merge_partials(a,b))`
/// holds for annotated fields (§8 reducer-associativity law).
pub fn merge_partials(mut a: StatePatch, b: StatePatch) -> StatePatch {
    for (id, result) in b.task_results {
        a.task_results.insert(id, result);
    }
    for (role, session) in b.driver_sessions {
        a.driver_sessions.insert(role, session);
    }
    a.history.extend(b.history);
    a.completed_steps.extend(b.completed_steps);
    if b.design.is_some() {
        a.design = b.design;
    }
    if b.plan.is_some() {
        a.plan = b.plan;
    }
    if b.plan_markdown.is_some() {
        a.plan_markdown = b.plan_markdown;
    }
    if b.plan_path.is_some() {
        a.plan_path = b.plan_path;
    }
    if b.goal.is_some() {
        a.goal = b.goal;
    }
    if b.last_review.is_some() {
        a.last_review = b.last_review;
    }
    if b.review_iteration.is_some() {
        a.review_iteration = b.review_iteration;
    }
    if b.plan_validation_result.is_some() {
        a.plan_validation_result = b.plan_validation_result;
    }
    if b.plan_revision_count.is_some() {
        a.plan_revision_count = b.plan_revision_count;
    }
    if b.current_task_id.is_some() {
        a.current_task_id = b.current_task_id;
    }
    if b.total_tasks.is_some() {
        a.total_tasks = b.total_tasks;
    }
    if b.current_task_index.is_some() {
        a.current_task_index = b.current_task_index;
    }
    if b.workflow_status.is_some() {
        a.workflow_status = b.workflow_status;
    }
    if b.human_approved.is_some() {
        a.human_approved = b.human_approved;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use amelia_types::{Issue, Status, WorkflowID};

    fn base() -> ExecutionState {
        ExecutionState::init(
            WorkflowID::from("wf-1"),
            ProfileID::from("default"),
            Issue {
                id: "T-1".into(),
                title: "add".into(),
                description: "add addition".into(),
            },
        )
    }

    #[test]
    fn task_results_merge_by_key_right_wins() {
        let state = base();
        let mut patch_a = StatePatch::new();
        patch_a.task_results.insert(
            TaskID::from("a"),
            TaskResult {
                task_id: TaskID::from("a"),
                status: Status::InProgress,
                output: None,
                error: None,
                completed_at: None,
            },
        );
        let mid = reduce(&state, patch_a).unwrap();

        let mut patch_b = StatePatch::new();
        patch_b.task_results.insert(
            TaskID::from("a"),
            TaskResult {
                task_id: TaskID::from("a"),
                status: Status::Completed,
                output: Some("done".into()),
                error: None,
                completed_at: None,
            },
        );
        let next = reduce(&mid, patch_b).unwrap();

        assert_eq!(
            next.task_results[&TaskID::from("a")].status,
            Status::Completed
        );
    }

    #[test]
    fn completed_steps_union_across_parallel_tasks() {
        let state = base();
        let mut patch_a = StatePatch::new();
        patch_a.completed_steps.insert("task:A".to_string());
        let mut patch_b = StatePatch::new();
        patch_b.completed_steps.insert("task:B".to_string());

        let merged = merge_partials(patch_a, patch_b);
        let next = reduce(&state, merged).unwrap();
        assert!(next.completed_steps.contains("task:A"));
        assert!(next.completed_steps.contains("task:B"));
    }

    #[test]
    fn concurrent_write_to_single_writer_field_is_rejected() {
        let state = base();
        let mut patch_a = StatePatch::new();
        patch_a.goal = Some(Some("ship it".into()));
        let mid = reduce(&state, patch_a).unwrap();

        let mut patch_b = StatePatch::new();
        patch_b.goal = Some(Some("ship it differently".into()));
        let err = reduce(&mid, patch_b).unwrap_err();
        assert_eq!(err, ConcurrentWriteError("goal"));
    }

    #[test]
    fn reducer_associativity_holds_for_annotated_fields() {
        let state = base();
        let mut a = StatePatch::new();
        a.completed_steps.insert("task:A".into());
        a.history.push(HistoryEntry {
            ts: chrono::Utc::now(),
            actor: "developer".into(),
            event: "task_started".into(),
            detail: Default::default(),
        });
        let mut b = StatePatch::new();
        b.completed_steps.insert("task:B".into());

        let sequential = reduce(&reduce(&state, a.clone()).unwrap(), b.clone()).unwrap();
        let merged = reduce(&state, merge_partials(a, b)).unwrap();

        assert_eq!(sequential.completed_steps, merged.completed_steps);
        assert_eq!(sequential.history.len(), merged.history.len());
    }

    #[test]
    fn history_is_append_only_and_order_preserving() {
        let state = base();
        let mut a = StatePatch::new();
        a.history.push(HistoryEntry {
            ts: chrono::Utc::now(),
            actor: "architect".into(),
            event: "plan_drafted".into(),
            detail: Default::default(),
        });
        let mid = reduce(&state, a).unwrap();

        let mut b = StatePatch::new();
        b.history.push(HistoryEntry {
            ts: chrono::Utc::now(),
            actor: "developer".into(),
            event: "task_started".into(),
            detail: Default::default(),
        });
        let next = reduce(&mid, b).unwrap();

        assert_eq!(next.history[0].event, "plan_drafted");
        assert_eq!(next.history[1].event, "task_started");
    }
}
