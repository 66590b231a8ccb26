use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    None,
    Container,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    pub mode: Option<SandboxMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub network_allowlist_enabled: bool,
    #[serde(default)]
    pub network_allowed_hosts: Vec<String>,
}

impl SandboxConfig {
    pub fn mode(&self) -> SandboxMode {
        self.mode.unwrap_or(SandboxMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKey {
    Api,
    Cli,
}
