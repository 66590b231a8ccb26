use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use amelia_core::error::AmeliaError;
use amelia_core::StatePatch;
use amelia_core::EventBus;
use amelia_drivers::{Driver, DriverFactory, GeneratedContent};
use amelia_scheduler::{step, TaskExecutor, TaskOutcome};
use amelia_types::{
    AgenticMessage, DriverSession, ExecutionState, HistoryEntry, Profile, ResolvedAgentConfig,
    ReviewResult, Role, Severity, Task, TaskDAG, TaskDagError,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;

use crate::plan_parser::{count_task_headings, parse_plan_tasks};

/// How a node turns a resolved agent config into a live `Driver`. Kept as
/// a swappable function rather than always calling `DriverFactory::build`
/// directly so end-to-end tests can hand every node a scripted test
/// double implementing `Driver` itself, the same way the teacher's own
/// test modules implement a production trait directly rather than
/// reaching for a mocking framework.
pub type DriverResolver =
    Arc<dyn Fn(&ResolvedAgentConfig) -> Result<Box<dyn Driver>, AmeliaError> + Send + Sync>;

pub fn production_driver_resolver() -> DriverResolver {
    Arc::new(DriverFactory::build)
}

/// Wires a node to the profile it runs under, the bus it reports to, and
/// how it turns a resolved agent config into a live `Driver`. Deliberately
/// carries no driver handle of its own — each node resolves and builds
/// its own `Driver` from the role it needs, so a failed container
/// teardown in one node never corrupts another's session.
#[derive(Clone)]
pub struct NodeContext {
    pub profile: Profile,
    pub event_bus: EventBus,
    pub resolve_driver: DriverResolver,
}

fn history(actor: &str, event: &str) -> HistoryEntry {
    HistoryEntry {
        ts: Utc::now(),
        actor: actor.to_string(),
        event: event.to_string(),
        detail: HashMap::new(),
    }
}

fn missing_agent(role: Role) -> AmeliaError {
    AmeliaError::SchemaValidation {
        schema_name: "profile".to_string(),
        reason: format!("profile has no `{}` agent configured", role.as_str()),
    }
}

pub async fn architect_node(
    state: &ExecutionState,
    cx: &NodeContext,
) -> Result<StatePatch, AmeliaError> {
    let resolved = cx
        .profile
        .resolve_agent(Role::Architect)
        .ok_or_else(|| missing_agent(Role::Architect))?;
    let driver = (cx.resolve_driver)(&resolved)?;

    let mut prompt = format!(
        "Issue {}: {}\n{}\n\nProduce a markdown implementation plan. Break the work into \
         one or more sections headed exactly `### Task N: <short description>`, numbered \
         from 1. If a task depends on an earlier one, add a line `Depends on: Task M` \
         directly under its heading.",
        state.issue.id, state.issue.title, state.issue.description,
    );
    if let Some(design) = &state.design {
        prompt.push_str(&format!("\n\nDesign brainstorm:\n{}", design.raw_content));
    }
    if let Some(result) = &state.plan_validation_result {
        if !result.valid {
            prompt.push_str(&format!(
                "\n\nThe previous plan was rejected. Address these issues:\n- {}",
                result.issues.join("\n- ")
            ));
        }
    }

    let session = state.driver_sessions.get(&Role::Architect).cloned();
    let (content, next_session) = driver.generate(&prompt, None, None, session).await?;
    let markdown = content.as_text();

    let tasks = parse_plan_tasks(&markdown);
    let dag = build_dag(tasks, &state.issue.id)?;
    let total_tasks = dag.tasks().len() as u32;

    let goal = state
        .design
        .as_ref()
        .map(|d| d.goal.clone())
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| state.issue.title.clone());

    let plan_path = format!(
        "{}/plan-{}.md",
        cx.profile.plan_output_dir.trim_end_matches('/'),
        state.workflow_id.as_str(),
    );
    if let Some(parent) = std::path::Path::new(&plan_path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AmeliaError::Sandbox {
                operation: "create_plan_dir".to_string(),
                reason: e.to_string(),
            })?;
    }
    tokio::fs::write(&plan_path, &markdown)
        .await
        .map_err(|e| AmeliaError::Sandbox {
            operation: "write_plan_file".to_string(),
            reason: e.to_string(),
        })?;

    let mut patch = StatePatch::new();
    patch.plan = Some(Some(dag));
    patch.plan_markdown = Some(Some(markdown));
    patch.plan_path = Some(Some(plan_path));
    patch.goal = Some(Some(goal));
    patch.total_tasks = Some(total_tasks);
    patch.driver_sessions.insert(Role::Architect, next_session);
    patch.history.push(history("architect", "plan_drafted"));
    Ok(patch)
}

/// Falls back to an empty-dependency plan if the parsed tasks would form
/// a cycle or duplicate id (possible if the architect's markdown names
/// the same task number twice) rather than failing the node outright.
fn build_dag(tasks: Vec<Task>, issue_id: &str) -> Result<TaskDAG, AmeliaError> {
    match TaskDAG::new(tasks.clone(), issue_id) {
        Ok(dag) => Ok(dag),
        Err(TaskDagError::DuplicateId(_)) => Err(AmeliaError::SchemaValidation {
            schema_name: "plan_tasks".to_string(),
            reason: "architect produced two tasks with the same number".to_string(),
        }),
        Err(_) => {
            let stripped: Vec<Task> = tasks
                .into_iter()
                .map(|mut t| {
                    t.dependencies.clear();
                    t
                })
                .collect();
            TaskDAG::new(stripped, issue_id).map_err(|e| AmeliaError::SchemaValidation {
                schema_name: "plan_tasks".to_string(),
                reason: e.to_string(),
            })
        }
    }
}

pub async fn plan_validator_node(
    state: &ExecutionState,
    cx: &NodeContext,
) -> Result<StatePatch, AmeliaError> {
    let markdown = state.plan_markdown.clone().unwrap_or_default();
    let trimmed = markdown.trim();

    let mut issues = Vec::new();
    if count_task_headings(&markdown) == 0 {
        issues.push("plan markdown has no `### Task N:` headings".to_string());
    }
    let goal_is_placeholder = state
        .goal
        .as_deref()
        .map(|g| {
            let g = g.trim();
            g.is_empty() || g.eq_ignore_ascii_case("todo") || g.eq_ignore_ascii_case("tbd")
        })
        .unwrap_or(true);
    if goal_is_placeholder {
        issues.push("goal is missing or a placeholder".to_string());
    }
    if trimmed.len() < 200 {
        issues.push(format!(
            "plan content is only {} characters, below the 200 minimum",
            trimmed.len()
        ));
    }

    let result = if issues.is_empty() {
        amelia_types::PlanValidationResult::ok()
    } else {
        amelia_types::PlanValidationResult::failed(issues)
    };

    let mut patch = StatePatch::new();

    // Structured-metadata extraction is a side concern from the pass/fail
    // verdict above: a `SchemaValidationError` here falls back to a local
    // regex summary rather than failing validation or restarting the node.
    if let Some(resolved) = cx.profile.resolve_agent(Role::PlanValidator) {
        let driver = (cx.resolve_driver)(&resolved)?;
        let schema = serde_json::json!({"required": ["summary"]});
        let prompt = format!("Summarize this implementation plan in one sentence:\n{markdown}");
        let summary = match driver.generate(&prompt, None, Some(&schema), None).await {
            Ok((GeneratedContent::Structured(value), _)) => value
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Ok((GeneratedContent::Text(text), _)) => text,
            Err(AmeliaError::SchemaValidation { .. }) => markdown
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or_default()
                .to_string(),
            Err(e) => return Err(e),
        };
        let mut entry = history(
            "plan_validator",
            if result.valid {
                "plan_validated"
            } else {
                "plan_validation_failed"
            },
        );
        entry.detail.insert("summary".to_string(), Value::String(summary));
        entry
            .detail
            .insert("severity".to_string(), Value::String(format!("{:?}", result.severity).to_lowercase()));
        patch.history.push(entry);
    } else {
        let mut entry = history(
            "plan_validator",
            if result.valid {
                "plan_validated"
            } else {
                "plan_validation_failed"
            },
        );
        entry
            .detail
            .insert("severity".to_string(), Value::String(format!("{:?}", result.severity).to_lowercase()));
        patch.history.push(entry);
    }

    if !result.valid {
        patch.plan_revision_count = Some(state.plan_revision_count + 1);
    }
    patch.plan_validation_result = Some(Some(result));
    Ok(patch)
}

/// Sets `workflow_status` to `awaiting_approval` for the engine to
/// checkpoint; the engine itself owns suspending on the approval gate and
/// folding the human's decision back into `human_approved` once it
/// resolves (§4.5, §4.6).
pub async fn human_approval_node(
    _state: &ExecutionState,
    cx: &NodeContext,
) -> Result<StatePatch, AmeliaError> {
    let mut patch = StatePatch::new();
    if cx.profile.auto_approve_reviews {
        patch.human_approved = Some(Some(true));
        patch
            .history
            .push(history("human_approval", "auto_approved"));
    } else {
        patch.workflow_status = Some(amelia_types::WorkflowStatus::AwaitingApproval);
        patch
            .history
            .push(history("human_approval", "awaiting_approval"));
    }
    Ok(patch)
}

struct DeveloperExecutor {
    driver: Arc<dyn Driver>,
    cwd: PathBuf,
    feedback: Option<String>,
}

#[async_trait]
impl TaskExecutor for DeveloperExecutor {
    async fn execute(&self, task: &Task) -> TaskOutcome {
        let mut prompt = format!("Implement task `{}`: {}", task.id, task.description);
        if let Some(feedback) = &self.feedback {
            prompt.push_str(&format!(
                "\n\nAddress this reviewer feedback before anything else:\n{feedback}"
            ));
        }

        let stream = self
            .driver
            .execute_agentic(&prompt, &self.cwd, None, None, None)
            .await;
        let mut stream = match stream {
            Ok((stream, _session)) => stream,
            Err(e) => return TaskOutcome::failed(e.to_string()),
        };

        let mut last = String::new();
        while let Some(message) = stream.next().await {
            match message {
                Ok(AgenticMessage::Result { content }) => last = content,
                Ok(_) => {}
                Err(e) => return TaskOutcome::failed(e.to_string()),
            }
        }
        TaskOutcome::completed(last)
    }
}

pub async fn developer_node(
    state: &ExecutionState,
    cx: &NodeContext,
) -> Result<StatePatch, AmeliaError> {
    let dag = state
        .plan
        .as_ref()
        .ok_or_else(|| AmeliaError::SchemaValidation {
            schema_name: "execution_state".to_string(),
            reason: "developer node reached with no plan".to_string(),
        })?;
    let resolved = cx
        .profile
        .resolve_agent(Role::Developer)
        .ok_or_else(|| missing_agent(Role::Developer))?;
    let driver: Arc<dyn Driver> = Arc::from((cx.resolve_driver)(&resolved)?);

    let feedback = state
        .last_review
        .as_ref()
        .filter(|r| !r.approved)
        .map(|r| r.comments.join("\n"));

    let executor = Arc::new(DeveloperExecutor {
        driver: driver.clone(),
        cwd: PathBuf::from(&cx.profile.working_dir),
        feedback,
    });

    let mut patch = step(
        dag,
        state,
        executor,
        cx.profile.execution_mode,
        cx.profile.max_parallel_tasks,
    )
    .await;

    let previous = state
        .driver_sessions
        .get(&Role::Developer)
        .cloned()
        .unwrap_or_default();
    patch.driver_sessions.insert(
        Role::Developer,
        DriverSession {
            model: Some(resolved.model.clone()),
            ..previous
        },
    );
    Ok(patch)
}

pub async fn reviewer_node(
    state: &ExecutionState,
    cx: &NodeContext,
) -> Result<StatePatch, AmeliaError> {
    let resolved = cx
        .profile
        .resolve_agent(Role::Reviewer)
        .ok_or_else(|| missing_agent(Role::Reviewer))?;
    let driver = (cx.resolve_driver)(&resolved)?;

    let completed_summary = state
        .plan
        .as_ref()
        .map(|dag| {
            dag.tasks()
                .iter()
                .filter_map(|t| state.task_results.get(&t.id))
                .map(|r| format!("- {}: {:?}", r.task_id, r.status))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let prompt = format!(
        "Review this completed task batch for issue `{}`:\n{}\n\nRespond with JSON \
         {{\"approved\": bool, \"comments\": [string]}}.",
        state.issue.id, completed_summary,
    );
    let schema = serde_json::json!({"required": ["approved"]});
    let session = state.driver_sessions.get(&Role::Reviewer).cloned();
    let (content, next_session) = driver.generate(&prompt, None, Some(&schema), session).await?;

    let review = match content {
        GeneratedContent::Structured(value) => {
            let approved = value.get("approved").and_then(Value::as_bool).unwrap_or(false);
            let comments = value
                .get("comments")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            ReviewResult {
                severity: if approved {
                    Severity::None
                } else {
                    Severity::from_issue_count(comments.len().max(1))
                },
                approved,
                comments,
            }
        }
        GeneratedContent::Text(text) => ReviewResult {
            approved: false,
            severity: Severity::Minor,
            comments: vec![text],
        },
    };

    let mut patch = StatePatch::new();
    patch.review_iteration = Some(state.review_iteration + 1);
    patch
        .history
        .push(history(
            "reviewer",
            if review.approved {
                "review_approved"
            } else {
                "review_rejected"
            },
        ));
    patch.last_review = Some(Some(review));
    patch.driver_sessions.insert(
        Role::Reviewer,
        DriverSession {
            model: Some(resolved.model.clone()),
            ..next_session
        },
    );
    Ok(patch)
}

pub async fn evaluator_node(
    state: &ExecutionState,
    cx: &NodeContext,
) -> Result<StatePatch, AmeliaError> {
    let Some(resolved) = cx.profile.resolve_agent(Role::Evaluator) else {
        let mut patch = StatePatch::new();
        patch.workflow_status = Some(amelia_types::WorkflowStatus::Completed);
        return Ok(patch);
    };
    let driver = (cx.resolve_driver)(&resolved)?;

    let prompt = format!(
        "Perform a final evaluation pass for issue `{}`. Goal: {}",
        state.issue.id,
        state.goal.clone().unwrap_or_default()
    );
    let session = state.driver_sessions.get(&Role::Evaluator).cloned();
    let (content, next_session) = driver.generate(&prompt, None, None, session).await?;

    let mut patch = StatePatch::new();
    patch.driver_sessions.insert(
        Role::Evaluator,
        DriverSession {
            model: Some(resolved.model.clone()),
            ..next_session
        },
    );
    patch.workflow_status = Some(amelia_types::WorkflowStatus::Completed);
    let mut entry = history("evaluator", "evaluation_completed");
    entry
        .detail
        .insert("summary".to_string(), Value::String(content.as_text()));
    patch.history.push(entry);
    Ok(patch)
}
