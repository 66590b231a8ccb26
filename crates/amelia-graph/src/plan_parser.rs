use std::collections::HashSet;

use amelia_types::{Task, TaskID};
use regex::Regex;

/// Extracts `### Task N: <description>` sections from the architect's
/// markdown, along with an optional `Depends on: N, M` line anywhere in
/// the section body. Grounded in the pack's regex-driven structured
/// extraction style (`data-designer-core::parser`), generalized from a
/// fixed DSL grammar to loose markdown scanning. Unknown or
/// self-referential dependency numbers are dropped rather than rejected —
/// `TaskDAG::new` is the authority on whether the result is well-formed.
pub fn parse_plan_tasks(markdown: &str) -> Vec<Task> {
    let heading = Regex::new(r"(?m)^###\s*Task\s*(\d+)\s*:\s*(.+)$").expect("valid regex");
    let depends = Regex::new(r"(?mi)^\s*depends on:\s*(.+)$").expect("valid regex");

    let headings: Vec<_> = heading.captures_iter(markdown).collect();
    let known: HashSet<String> = headings.iter().map(|c| c[1].to_string()).collect();

    headings
        .iter()
        .enumerate()
        .map(|(i, cap)| {
            let number = cap[1].to_string();
            let description = cap[2].trim().to_string();
            let start = cap.get(0).expect("match 0 always present").end();
            let end = headings
                .get(i + 1)
                .map(|next| next.get(0).expect("match 0 always present").start())
                .unwrap_or(markdown.len());
            let body = &markdown[start..end];

            let dependencies = depends
                .captures(body)
                .map(|d| {
                    d[1].split(',')
                        .map(|s| s.trim().trim_start_matches("Task").trim().to_string())
                        .filter(|n| n != &number && known.contains(n))
                        .map(|n| TaskID::from(format!("task-{n}")))
                        .collect()
                })
                .unwrap_or_default();

            Task {
                id: TaskID::from(format!("task-{number}")),
                description,
                dependencies,
                files: Vec::new(),
                steps: Vec::new(),
                commit_message: None,
            }
        })
        .collect()
}

pub fn count_task_headings(markdown: &str) -> usize {
    Regex::new(r"(?m)^###\s*Task\s*\d+\s*:")
        .expect("valid regex")
        .find_iter(markdown)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sequential_tasks_without_dependencies() {
        let markdown = "### Task 1: write the parser\nDo the thing.\n\n### Task 2: write tests\nCover it.\n";
        let tasks = parse_plan_tasks(markdown);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, TaskID::from("task-1"));
        assert_eq!(tasks[1].description, "write tests");
        assert!(tasks[1].dependencies.is_empty());
    }

    #[test]
    fn parses_depends_on_line_into_dependencies() {
        let markdown =
            "### Task 1: scaffold\nSetup.\n\n### Task 2: implement\nDepends on: Task 1\nBuild it.\n";
        let tasks = parse_plan_tasks(markdown);
        assert_eq!(tasks[1].dependencies, [TaskID::from("task-1")].into());
    }

    #[test]
    fn drops_dependencies_on_unknown_task_numbers() {
        let markdown = "### Task 1: scaffold\nDepends on: Task 9\n";
        let tasks = parse_plan_tasks(markdown);
        assert!(tasks[0].dependencies.is_empty());
    }

    #[test]
    fn count_task_headings_ignores_non_heading_lines() {
        let markdown = "no headings here\njust prose";
        assert_eq!(count_task_headings(markdown), 0);
    }
}
