use std::path::Path;
use std::pin::Pin;

use amelia_core::error::AmeliaError;
use amelia_types::{AgenticMessage, DriverSession, ResolvedAgentConfig, TokenUsage};
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

/// `generate`'s result: either free text or, when a schema was supplied,
/// a value that already passed schema validation (§4.2).
#[derive(Debug, Clone)]
pub enum GeneratedContent {
    Text(String),
    Structured(Value),
}

impl GeneratedContent {
    pub fn as_text(&self) -> String {
        match self {
            GeneratedContent::Text(text) => text.clone(),
            GeneratedContent::Structured(value) => value.to_string(),
        }
    }
}

pub type AgenticStream = Pin<Box<dyn Stream<Item = Result<AgenticMessage, AmeliaError>> + Send>>;

/// The uniform interface over API, CLI, and container drivers (§4.2). A
/// failed schema match raises `SchemaValidationError`, never
/// `TransientProviderError` — only the latter is retried by the scheduler.
#[async_trait]
pub trait Driver: Send + Sync {
    /// One-shot generation. `schema`, when present, is a JSON Schema the
    /// returned content must validate against.
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        schema: Option<&Value>,
        session: Option<DriverSession>,
    ) -> Result<(GeneratedContent, DriverSession), AmeliaError>;

    /// Streams an agentic tool-use session. `usage` is never yielded on
    /// the stream; call `get_usage` afterwards instead (§4.2, §9).
    async fn execute_agentic(
        &self,
        prompt: &str,
        cwd: &Path,
        instructions: Option<&str>,
        allowed_tools: Option<&[String]>,
        session: Option<DriverSession>,
    ) -> Result<(AgenticStream, DriverSession), AmeliaError>;

    fn get_usage(&self) -> Option<TokenUsage>;

    /// Container driver is stateless and always returns `false` (§4.2).
    async fn cleanup_session(&self, session_id: &str) -> bool {
        let _ = session_id;
        false
    }
}

/// Minimal JSON Schema check: every key in `schema.required` must be
/// present in `value`. Sufficient for the structural validation this
/// driver layer needs; deep type-checking is left to the caller's own
/// deserialization of the structured content.
pub fn validate_against_schema(value: &Value, schema: &Value) -> Result<(), AmeliaError> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let Some(object) = value.as_object() else {
        return Err(AmeliaError::SchemaValidation {
            schema_name: schema
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("unnamed")
                .to_string(),
            reason: "driver response is not a JSON object".to_string(),
        });
    };
    for key in required {
        let Some(key) = key.as_str() else { continue };
        if !object.contains_key(key) {
            return Err(AmeliaError::SchemaValidation {
                schema_name: schema
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("unnamed")
                    .to_string(),
                reason: format!("missing required field `{key}`"),
            });
        }
    }
    Ok(())
}

/// Builds the right driver for `(resolved.driver, resolved.sandbox.mode)`
/// per the table in §4.2. The container+cli combination is rejected
/// rather than silently falling back to an unsandboxed CLI invocation.
pub struct DriverFactory;

impl DriverFactory {
    pub fn build(resolved: &ResolvedAgentConfig) -> Result<Box<dyn Driver>, AmeliaError> {
        use amelia_types::{DriverKey, SandboxMode};

        match (resolved.driver, resolved.sandbox.mode()) {
            (DriverKey::Api, SandboxMode::None) => {
                Ok(Box::new(crate::api::ApiDriver::new(resolved.model.clone())))
            }
            (DriverKey::Cli, SandboxMode::None) => {
                Ok(Box::new(crate::cli::CliDriver::new(resolved.model.clone())))
            }
            (DriverKey::Api, SandboxMode::Container) => Ok(Box::new(
                crate::container::ContainerDriver::new(resolved.clone())?,
            )),
            (DriverKey::Cli, SandboxMode::Container) => Err(AmeliaError::Sandbox {
                operation: "driver_selection".to_string(),
                reason: "CLI driver inside a container sandbox is not supported".to_string(),
            }),
        }
    }
}
