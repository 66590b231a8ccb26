use amelia_types::{ExecutionState, Profile, Role, TaskDAG, WorkflowStatus};

/// The six workflow nodes plus the terminal sink. `End` is a fixed point:
/// `route` always maps it back to itself (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphNode {
    Architect,
    PlanValidator,
    HumanApproval,
    Developer,
    Reviewer,
    Evaluator,
    End,
}

impl GraphNode {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphNode::Architect => "architect",
            GraphNode::PlanValidator => "plan_validator",
            GraphNode::HumanApproval => "human_approval",
            GraphNode::Developer => "developer",
            GraphNode::Reviewer => "reviewer",
            GraphNode::Evaluator => "evaluator",
            GraphNode::End => "end",
        }
    }
}

/// The routing table of §4.5, evaluated against the state a node just
/// produced. Pure and side-effect free so it can be unit-tested directly
/// against the table without a driver or sandbox in the loop.
pub fn route(from: GraphNode, state: &ExecutionState, profile: &Profile) -> GraphNode {
    match from {
        GraphNode::Architect => GraphNode::PlanValidator,
        GraphNode::PlanValidator => route_from_plan_validator(state, profile),
        GraphNode::HumanApproval => route_from_human_approval(state),
        GraphNode::Developer => route_from_developer(state, profile),
        GraphNode::Reviewer => route_from_reviewer(state, profile),
        GraphNode::Evaluator => GraphNode::End,
        GraphNode::End => GraphNode::End,
    }
}

fn route_from_plan_validator(state: &ExecutionState, profile: &Profile) -> GraphNode {
    match &state.plan_validation_result {
        None => GraphNode::HumanApproval,
        Some(result) if result.valid => GraphNode::HumanApproval,
        Some(_) => {
            let max = profile.max_iterations_for(Role::PlanValidator);
            if state.plan_revision_count < max {
                GraphNode::Architect
            } else {
                // Exhausted revisions: escalate the unresolved plan to a
                // human rather than looping the architect forever.
                GraphNode::HumanApproval
            }
        }
    }
}

fn route_from_human_approval(state: &ExecutionState) -> GraphNode {
    match state.human_approved {
        Some(true) => GraphNode::Developer,
        Some(false) => GraphNode::End,
        None => GraphNode::HumanApproval,
    }
}

fn dag_finished(dag: &TaskDAG, state: &ExecutionState) -> bool {
    dag.tasks()
        .iter()
        .all(|t| state.get_task_status(&t.id).is_some_and(|s| s.is_terminal()))
}

fn route_from_developer(state: &ExecutionState, profile: &Profile) -> GraphNode {
    if state.workflow_status == WorkflowStatus::Failed {
        return GraphNode::End;
    }
    match &state.plan {
        Some(dag) if dag_finished(dag, state) => {
            if profile.agents.contains_key(&Role::Evaluator) {
                GraphNode::Evaluator
            } else {
                GraphNode::End
            }
        }
        _ => GraphNode::Reviewer,
    }
}

fn route_from_reviewer(state: &ExecutionState, profile: &Profile) -> GraphNode {
    let max = profile.max_iterations_for(Role::Reviewer);
    let approved = state.last_review.as_ref().is_some_and(|r| r.approved);
    if approved || state.review_iteration >= max {
        // Approved, or out of iterations either way: this batch is closed.
        // Only defer to developer's own completion check (End vs evaluator)
        // once the whole DAG is actually finished — otherwise there is a
        // later scheduling batch still waiting, and `route_from_developer`
        // would just bounce straight back to `Reviewer`, since it has no
        // completed review to see yet for that batch.
        match &state.plan {
            Some(dag) if dag_finished(dag, state) => route_from_developer(state, profile),
            _ => GraphNode::Developer,
        }
    } else {
        GraphNode::Developer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amelia_types::{
        AgentConfig, AgentOptions, DriverKey, Issue, PlanValidationResult, ProfileID,
        RetryConfig, ReviewResult, SandboxConfig, Severity, Status, Task, TaskID, TaskResult,
        Tracker, WorkflowID,
    };
    use std::collections::HashMap;

    fn profile(max_plan_revisions: u32, max_review_iterations: u32, with_evaluator: bool) -> Profile {
        let mut agents = HashMap::new();
        agents.insert(
            Role::PlanValidator,
            AgentConfig {
                driver: DriverKey::Api,
                model: "claude".into(),
                options: AgentOptions {
                    max_iterations: Some(max_plan_revisions),
                    ..Default::default()
                },
            },
        );
        if with_evaluator {
            agents.insert(
                Role::Evaluator,
                AgentConfig {
                    driver: DriverKey::Api,
                    model: "claude".into(),
                    options: AgentOptions::default(),
                },
            );
        }
        Profile {
            name: "default".into(),
            agents,
            sandbox: SandboxConfig::default(),
            tracker: Tracker::Noop,
            working_dir: ".".into(),
            plan_output_dir: "plans".into(),
            plan_path_pattern: None,
            retry: RetryConfig::default(),
            max_task_review_iterations: max_review_iterations,
            auto_approve_reviews: false,
            execution_mode: amelia_types::ExecutionMode::Agentic,
            max_parallel_tasks: 4,
        }
    }

    fn state() -> ExecutionState {
        ExecutionState::init(
            WorkflowID::from("wf-1"),
            ProfileID::from("default"),
            Issue {
                id: "T-1".into(),
                title: "t".into(),
                description: "d".into(),
            },
        )
    }

    #[test]
    fn architect_always_routes_to_plan_validator() {
        let p = profile(2, 3, false);
        assert_eq!(
            route(GraphNode::Architect, &state(), &p),
            GraphNode::PlanValidator
        );
    }

    #[test]
    fn plan_validator_routes_to_human_approval_when_valid() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan_validation_result = Some(PlanValidationResult::ok());
        assert_eq!(
            route(GraphNode::PlanValidator, &s, &p),
            GraphNode::HumanApproval
        );
    }

    #[test]
    fn plan_validator_sends_back_to_architect_when_invalid_and_revisions_remain() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan_validation_result = Some(PlanValidationResult::failed(vec!["no tasks".into()]));
        s.plan_revision_count = 0;
        assert_eq!(
            route(GraphNode::PlanValidator, &s, &p),
            GraphNode::Architect
        );
    }

    #[test]
    fn plan_validator_escalates_to_human_approval_once_revisions_exhausted() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan_validation_result = Some(PlanValidationResult::failed(vec!["no tasks".into()]));
        s.plan_revision_count = 2;
        assert_eq!(
            route(GraphNode::PlanValidator, &s, &p),
            GraphNode::HumanApproval
        );
    }

    #[test]
    fn human_approval_routes_to_developer_when_approved() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.human_approved = Some(true);
        assert_eq!(route(GraphNode::HumanApproval, &s, &p), GraphNode::Developer);
    }

    #[test]
    fn human_approval_routes_to_end_when_rejected() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.human_approved = Some(false);
        assert_eq!(route(GraphNode::HumanApproval, &s, &p), GraphNode::End);
    }

    #[test]
    fn human_approval_stays_put_while_unresolved() {
        let p = profile(2, 3, false);
        let s = state();
        assert_eq!(
            route(GraphNode::HumanApproval, &s, &p),
            GraphNode::HumanApproval
        );
    }

    fn task(id: &str) -> Task {
        Task {
            id: TaskID::from(id),
            description: id.to_string(),
            dependencies: Default::default(),
            files: Vec::new(),
            steps: Vec::new(),
            commit_message: None,
        }
    }

    #[test]
    fn developer_routes_to_reviewer_while_tasks_remain() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a")], "T-1").unwrap());
        assert_eq!(route(GraphNode::Developer, &s, &p), GraphNode::Reviewer);
    }

    #[test]
    fn developer_routes_to_end_once_all_tasks_are_terminal_without_an_evaluator() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a")], "T-1").unwrap());
        s.task_results.insert(
            TaskID::from("a"),
            TaskResult {
                task_id: TaskID::from("a"),
                status: Status::Completed,
                output: None,
                error: None,
                completed_at: None,
            },
        );
        assert_eq!(route(GraphNode::Developer, &s, &p), GraphNode::End);
    }

    #[test]
    fn developer_routes_to_evaluator_once_all_tasks_are_terminal_with_an_evaluator_configured() {
        let p = profile(2, 3, true);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a")], "T-1").unwrap());
        s.task_results.insert(
            TaskID::from("a"),
            TaskResult {
                task_id: TaskID::from("a"),
                status: Status::Completed,
                output: None,
                error: None,
                completed_at: None,
            },
        );
        assert_eq!(route(GraphNode::Developer, &s, &p), GraphNode::Evaluator);
    }

    #[test]
    fn developer_routes_to_end_on_workflow_failure_regardless_of_plan_state() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a")], "T-1").unwrap());
        s.workflow_status = WorkflowStatus::Failed;
        assert_eq!(route(GraphNode::Developer, &s, &p), GraphNode::End);
    }

    #[test]
    fn reviewer_sends_back_to_developer_when_not_approved_and_iterations_remain() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a")], "T-1").unwrap());
        s.last_review = Some(ReviewResult {
            approved: false,
            severity: Severity::Minor,
            comments: vec!["fix it".into()],
        });
        s.review_iteration = 1;
        assert_eq!(route(GraphNode::Reviewer, &s, &p), GraphNode::Developer);
    }

    #[test]
    fn reviewer_routes_straight_to_developer_on_approval_when_more_batches_remain() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a"), task("b")], "T-1").unwrap());
        s.task_results.insert(
            TaskID::from("a"),
            TaskResult {
                task_id: TaskID::from("a"),
                status: Status::Completed,
                output: None,
                error: None,
                completed_at: None,
            },
        );
        s.last_review = Some(ReviewResult {
            approved: true,
            severity: Severity::None,
            comments: vec![],
        });
        s.review_iteration = 1;
        assert_eq!(route(GraphNode::Reviewer, &s, &p), GraphNode::Developer);
    }

    #[test]
    fn reviewer_defers_to_developer_completion_check_once_iterations_are_exhausted() {
        let p = profile(2, 3, false);
        let mut s = state();
        s.plan = Some(TaskDAG::new(vec![task("a")], "T-1").unwrap());
        s.task_results.insert(
            TaskID::from("a"),
            TaskResult {
                task_id: TaskID::from("a"),
                status: Status::Completed,
                output: None,
                error: None,
                completed_at: None,
            },
        );
        s.last_review = Some(ReviewResult {
            approved: false,
            severity: Severity::Minor,
            comments: vec!["still not great".into()],
        });
        s.review_iteration = 3;
        assert_eq!(route(GraphNode::Reviewer, &s, &p), GraphNode::End);
    }
}
