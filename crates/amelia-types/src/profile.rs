use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::Role;
use crate::sandbox::{DriverKey, SandboxConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tracker {
    Jira,
    Github,
    Noop,
}

/// Fail-fast vs continue policy for `amelia_scheduler::step` (§4.4). Under
/// `Agentic`, any task reaching `Status::Failed` aborts the whole
/// workflow; under `Lenient`, the scheduler keeps running whatever
/// remains reachable and only the tasks downstream of the failure are
/// blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Agentic,
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_model: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Per-agent override as stored on a `Profile`. Sandbox and profile name
/// are deliberately absent here — they are injected at lookup time by
/// `Profile::resolve_agent` so updating a profile's sandbox never requires
/// walking every agent entry (§3.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub driver: DriverKey,
    pub model: String,
    #[serde(default)]
    pub options: AgentOptions,
}

/// The fully resolved view handed to a node: the stored `AgentConfig` plus
/// the profile's sandbox and name, injected, never persisted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAgentConfig {
    pub driver: DriverKey,
    pub model: String,
    pub options: AgentOptions,
    pub sandbox: SandboxConfig,
    pub profile_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub agents: HashMap<Role, AgentConfig>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default = "default_tracker")]
    pub tracker: Tracker,
    pub working_dir: String,
    pub plan_output_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path_pattern: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_max_review_iterations")]
    pub max_task_review_iterations: u32,
    #[serde(default)]
    pub auto_approve_reviews: bool,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
}

fn default_tracker() -> Tracker {
    Tracker::Noop
}

fn default_max_review_iterations() -> u32 {
    3
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Agentic
}

fn default_max_parallel_tasks() -> usize {
    4
}

impl Profile {
    /// Looks up the stored `AgentConfig` for `role` and injects this
    /// profile's sandbox/name, never mutating the stored value (§3.4).
    pub fn resolve_agent(&self, role: Role) -> Option<ResolvedAgentConfig> {
        let agent = self.agents.get(&role)?;
        Some(ResolvedAgentConfig {
            driver: agent.driver,
            model: agent.model.clone(),
            options: agent.options.clone(),
            sandbox: self.sandbox.clone(),
            profile_name: self.name.clone(),
        })
    }

    pub fn max_iterations_for(&self, role: Role) -> u32 {
        self.agents
            .get(&role)
            .and_then(|a| a.options.max_iterations)
            .unwrap_or(self.max_task_review_iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxMode;

    fn sample_profile() -> Profile {
        let mut agents = HashMap::new();
        agents.insert(
            Role::Developer,
            AgentConfig {
                driver: DriverKey::Api,
                model: "claude".into(),
                options: AgentOptions::default(),
            },
        );
        Profile {
            name: "default".into(),
            agents,
            sandbox: SandboxConfig {
                mode: Some(SandboxMode::Container),
                image: Some("amelia-sandbox:latest".into()),
                network_allowlist_enabled: true,
                network_allowed_hosts: vec!["api.anthropic.com".into()],
            },
            tracker: Tracker::Noop,
            working_dir: ".".into(),
            plan_output_dir: "plans".into(),
            plan_path_pattern: None,
            retry: RetryConfig::default(),
            max_task_review_iterations: 3,
            auto_approve_reviews: false,
            execution_mode: ExecutionMode::Agentic,
            max_parallel_tasks: 4,
        }
    }

    #[test]
    fn resolve_agent_injects_sandbox_and_name() {
        let profile = sample_profile();
        let resolved = profile.resolve_agent(Role::Developer).unwrap();
        assert_eq!(resolved.profile_name, "default");
        assert_eq!(resolved.sandbox.mode(), SandboxMode::Container);
    }

    #[test]
    fn resolve_agent_missing_role_is_none() {
        let profile = sample_profile();
        assert!(profile.resolve_agent(Role::Reviewer).is_none());
    }

    #[test]
    fn updating_profile_sandbox_does_not_touch_stored_agent_config() {
        let mut profile = sample_profile();
        let before = profile.agents.get(&Role::Developer).cloned().unwrap();
        profile.sandbox.network_allowlist_enabled = false;
        let after = profile.agents.get(&Role::Developer).cloned().unwrap();
        assert_eq!(before, after);
    }
}
