use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent role, also used to key per-role `DriverSession`s and profile
/// `AgentConfig` overrides so parallel nodes never share a session (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Architect,
    PlanValidator,
    Developer,
    Reviewer,
    Evaluator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Architect => "architect",
            Role::PlanValidator => "plan_validator",
            Role::Developer => "developer",
            Role::Reviewer => "reviewer",
            Role::Evaluator => "evaluator",
        }
    }
}

/// Scoped per agent role; a driver returns a new session after every call,
/// merged by role under `dict_merge` (§3.2, §3.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DriverSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub provider_data: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub actor: String,
    pub event: String,
    #[serde(default)]
    pub detail: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Streamed by `Driver::execute_agentic`. Deliberately has no `usage`
/// variant: usage is captured by the driver and retrieved separately via
/// `Driver::get_usage`, per the Open Question resolution in §9.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgenticMessage {
    Thinking { text: String },
    ToolCall { name: String, args: Value },
    ToolResult { name: String, result: Value },
    Text { text: String },
    Result { content: String },
}
