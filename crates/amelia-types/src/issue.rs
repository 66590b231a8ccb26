use serde::{Deserialize, Serialize};

/// The input ticket. Immutable for the lifetime of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// Optional structured brainstorming output produced ahead of the
/// architect node (or supplied by the caller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Design {
    pub title: String,
    pub goal: String,
    pub architecture: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing_strategy: Option<String>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conventions: Option<String>,
    pub raw_content: String,
}
