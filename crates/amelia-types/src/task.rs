use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{Status, TaskID};

/// A single 2-5 minute action: write a test, run a command, commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationKind {
    Create,
    Modify,
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperation {
    pub operation: FileOperationKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_range: Option<(u32, u32)>,
}

/// Status is derived from `ExecutionState.task_results`, never stored here,
/// so a `Task` stays invariant across parallel reducer merges (§3.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskID,
    pub description: String,
    #[serde(default)]
    pub dependencies: HashSet<TaskID>,
    #[serde(default)]
    pub files: Vec<FileOperation>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskDagError {
    #[error("task `{0}` depends on unknown task `{1}`")]
    UnknownDependency(String, String),
    #[error("duplicate task id `{0}`")]
    DuplicateId(String),
    #[error("dependency cycle detected through task `{0}`")]
    Cycle(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDAG {
    tasks: Vec<Task>,
    pub original_issue: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

impl TaskDAG {
    /// Validates uniqueness, dependency references, and acyclicity at
    /// construction time so invalid values can never enter `ExecutionState`
    /// (§4.1: validation lives in the constructor, not the reducer).
    pub fn new(tasks: Vec<Task>, original_issue: impl Into<String>) -> Result<Self, TaskDagError> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.clone()) {
                return Err(TaskDagError::DuplicateId(task.id.to_string()));
            }
        }
        let ids: HashSet<&TaskID> = tasks.iter().map(|t| &t.id).collect();
        for task in &tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep) {
                    return Err(TaskDagError::UnknownDependency(
                        task.id.to_string(),
                        dep.to_string(),
                    ));
                }
            }
        }

        let by_id: HashMap<&TaskID, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
        let mut colors: HashMap<&TaskID, Color> =
            tasks.iter().map(|t| (&t.id, Color::White)).collect();
        for task in &tasks {
            if colors[&task.id] == Color::White {
                visit(&task.id, &by_id, &mut colors)?;
            }
        }

        Ok(Self {
            tasks,
            original_issue: original_issue.into(),
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskID) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

fn visit<'a>(
    id: &'a TaskID,
    by_id: &HashMap<&'a TaskID, &'a Task>,
    colors: &mut HashMap<&'a TaskID, Color>,
) -> Result<(), TaskDagError> {
    colors.insert(id, Color::Grey);
    if let Some(task) = by_id.get(id) {
        for dep in &task.dependencies {
            match colors.get(dep).copied().unwrap_or(Color::White) {
                Color::White => visit(dep, by_id, colors)?,
                Color::Grey => return Err(TaskDagError::Cycle(dep.to_string())),
                Color::Black => {}
            }
        }
    }
    colors.insert(id, Color::Black);
    Ok(())
}

/// Immutable; a new `TaskResult` replaces an older one for the same
/// `task_id` under `dict_merge` (§3.2, §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskID,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: TaskID::from(id),
            description: id.to_string(),
            dependencies: deps.iter().map(|d| TaskID::from(*d)).collect(),
            files: Vec::new(),
            steps: Vec::new(),
            commit_message: None,
        }
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = TaskDAG::new(vec![task("a", &["ghost"])], "T-1").unwrap_err();
        assert_eq!(
            err,
            TaskDagError::UnknownDependency("a".into(), "ghost".into())
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = TaskDAG::new(vec![task("a", &[]), task("a", &[])], "T-1").unwrap_err();
        assert_eq!(err, TaskDagError::DuplicateId("a".into()));
    }

    #[test]
    fn rejects_cycles() {
        let err = TaskDAG::new(vec![task("a", &["b"]), task("b", &["a"])], "T-1").unwrap_err();
        assert!(matches!(err, TaskDagError::Cycle(_)));
    }

    #[test]
    fn accepts_valid_diamond() {
        let dag = TaskDAG::new(
            vec![
                task("a", &[]),
                task("b", &["a"]),
                task("c", &["a"]),
                task("d", &["b", "c"]),
            ],
            "T-1",
        )
        .unwrap();
        assert_eq!(dag.tasks().len(), 4);
    }
}
