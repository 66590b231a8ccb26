use serde::{Deserialize, Serialize};

use crate::ids::Severity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub approved: bool,
    pub severity: Severity,
    #[serde(default)]
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanValidationResult {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    pub severity: Severity,
}

impl PlanValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
            severity: Severity::None,
        }
    }

    pub fn failed(issues: Vec<String>) -> Self {
        let severity = Severity::from_issue_count(issues.len());
        Self {
            valid: false,
            issues,
            severity,
        }
    }
}
