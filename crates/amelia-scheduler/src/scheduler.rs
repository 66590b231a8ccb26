use std::sync::Arc;

use amelia_core::StatePatch;
use amelia_types::{
    ExecutionMode, ExecutionState, HistoryEntry, Status, Task, TaskDAG, TaskID, TaskResult,
    WorkflowStatus,
};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// What a task execution produced. `status` must be a terminal value —
/// `Completed` or `Failed` — the scheduler never asks an executor to
/// report an in-progress state.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: Status,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: Status::Completed,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Runs a single task to completion. Implemented by `amelia-graph`'s
/// developer node against a `Driver`; kept as a narrow trait here so this
/// crate never depends on `amelia-drivers` (§4.4).
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskOutcome;
}

/// Tasks whose status is `pending` and every dependency has status
/// `completed` (§4.4).
pub fn ready_tasks<'a>(dag: &'a TaskDAG, state: &ExecutionState) -> Vec<&'a Task> {
    dag.tasks()
        .iter()
        .filter(|task| {
            state.get_task_status(&task.id).unwrap_or(Status::Pending) == Status::Pending
                && task
                    .dependencies
                    .iter()
                    .all(|dep| state.get_task_status(dep) == Some(Status::Completed))
        })
        .collect()
}

/// Tasks that can never become ready because at least one dependency has
/// terminally failed. Mirrors the teacher's `TaskScheduler::update_blocked_tasks`,
/// generalized from a blocked/pending toggle to a permanent `Skipped`
/// result, since a failed dependency in this DAG model never un-fails.
fn blocked_tasks<'a>(dag: &'a TaskDAG, state: &ExecutionState) -> Vec<&'a Task> {
    dag.tasks()
        .iter()
        .filter(|task| {
            state.get_task_status(&task.id).unwrap_or(Status::Pending) == Status::Pending
                && task
                    .dependencies
                    .iter()
                    .any(|dep| state.get_task_status(dep) == Some(Status::Failed))
        })
        .collect()
}

/// `(completed, total)` task counts for the plan, per §4.4.
pub fn progress(dag: &TaskDAG, state: &ExecutionState) -> (usize, usize) {
    let total = dag.tasks().len();
    let completed = dag
        .tasks()
        .iter()
        .filter(|t| state.get_task_status(&t.id) == Some(Status::Completed))
        .count();
    (completed, total)
}

/// Runs every currently-ready task in parallel, bounded by `max_parallel`
/// via a `tokio::sync::Semaphore` (grounded in the teacher's
/// `OrchestratorEngine::run_execution_loop` task-permit/`JoinSet` pattern).
/// Under `ExecutionMode::Agentic` a single task failure short-circuits the
/// batch and sets `workflow_status = failed`; under `ExecutionMode::Lenient`
/// the batch still runs to completion and tasks downstream of the failure
/// are marked `skipped` rather than looping on `ready_tasks` forever (§4.4).
pub async fn step(
    dag: &TaskDAG,
    state: &ExecutionState,
    executor: Arc<dyn TaskExecutor>,
    execution_mode: ExecutionMode,
    max_parallel: usize,
) -> StatePatch {
    let runnable: Vec<Task> = ready_tasks(dag, state).into_iter().cloned().collect();
    let mut patch = StatePatch::new();
    if runnable.is_empty() {
        return patch;
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut join_set: JoinSet<(TaskID, TaskOutcome)> = JoinSet::new();

    for task in runnable {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed while tasks are in flight");
        let executor = executor.clone();
        let task_id = task.id.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let outcome = executor.execute(&task).await;
            (task_id, outcome)
        });
    }

    let mut any_failed = false;
    while let Some(joined) = join_set.join_next().await {
        let (task_id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("task execution panicked: {e}");
                continue;
            }
        };
        if outcome.status == Status::Failed {
            any_failed = true;
        } else if outcome.status == Status::Completed {
            patch.completed_steps.insert(format!("task:{}", task_id.as_str()));
        }
        patch.history.push(HistoryEntry {
            ts: chrono::Utc::now(),
            actor: "scheduler".to_string(),
            event: match outcome.status {
                Status::Completed => "task_completed".to_string(),
                Status::Failed => "task_failed".to_string(),
                _ => "task_finished".to_string(),
            },
            detail: Default::default(),
        });
        patch.task_results.insert(
            task_id.clone(),
            TaskResult {
                task_id,
                status: outcome.status,
                output: outcome.output,
                error: outcome.error,
                completed_at: Some(chrono::Utc::now()),
            },
        );
    }

    if any_failed {
        if execution_mode == ExecutionMode::Agentic {
            patch.workflow_status = Some(WorkflowStatus::Failed);
            return patch;
        }

        let mut scratch = state.clone();
        for (id, result) in &patch.task_results {
            scratch.task_results.insert(id.clone(), result.clone());
        }
        for task in blocked_tasks(dag, &scratch) {
            patch.task_results.insert(
                task.id.clone(),
                TaskResult {
                    task_id: task.id.clone(),
                    status: Status::Skipped,
                    output: None,
                    error: Some("blocked by failed dependency".to_string()),
                    completed_at: Some(chrono::Utc::now()),
                },
            );
        }
    }

    let (completed, total) = progress(dag, state);
    if completed == total && total > 0 && !any_failed {
        patch.workflow_status = Some(WorkflowStatus::Completed);
    }

    patch
}
