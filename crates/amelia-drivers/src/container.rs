use std::path::Path;

use amelia_core::error::AmeliaError;
use amelia_types::{AgenticMessage, DriverSession, ResolvedAgentConfig, TokenUsage};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::cli::parse_agentic_line;
use crate::driver::{validate_against_schema, AgenticStream, Driver, GeneratedContent};
use crate::sandbox::docker::DockerSandboxProvider;
use crate::sandbox::SandboxProvider;

/// Runs a driver call inside a sandboxed container by exec'ing a worker
/// module over `SandboxProvider::exec_stream` and parsing its stdout the
/// same line-oriented way `CliDriver` does (§4.2, §4.3). Stateless —
/// `cleanup_session` always returns the trait's default `false`, and
/// `session_id` is otherwise ignored, since the container itself is
/// torn down and rebuilt per workflow rather than kept warm per session.
pub struct ContainerDriver {
    model: String,
    provider: DockerSandboxProvider,
    usage: RwLock<Option<TokenUsage>>,
}

impl ContainerDriver {
    pub fn new(resolved: ResolvedAgentConfig) -> Result<Self, AmeliaError> {
        let image = resolved.sandbox.image.clone().ok_or_else(|| AmeliaError::Sandbox {
            operation: "container_driver_init".to_string(),
            reason: "sandbox.image is required for a container-mode agent".to_string(),
        })?;
        let proxy_host =
            std::env::var("AMELIA_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1:8088".to_string());
        let provider = DockerSandboxProvider::new(
            &resolved.profile_name,
            image,
            proxy_host,
            resolved.sandbox.network_allowlist_enabled,
            resolved.sandbox.network_allowed_hosts.clone(),
        );
        Ok(Self {
            model: resolved.model,
            provider,
            usage: RwLock::new(None),
        })
    }

    async fn run_generate_worker(
        &self,
        prompt_path: &Path,
        system: Option<&str>,
    ) -> Result<String, AmeliaError> {
        let request = json!({
            "mode": "generate",
            "model": self.model,
            "prompt_file": prompt_path.to_string_lossy(),
            "system": system,
        });
        let command = vec![
            "amelia-worker".to_string(),
            "--request".to_string(),
            request.to_string(),
        ];
        let mut stream = self.provider.exec_stream(&command, None, None, None).await?;

        let mut last_line = String::new();
        while let Some(line) = stream.next().await {
            last_line = line?;
        }
        Ok(last_line)
    }
}

/// Writes `prompt` to a host-side temp file under `/tmp` so it never
/// rides the container exec argv (the worker takes a path, not inline
/// text, since prompts can exceed a shell's argument length limit). The
/// caller is responsible for removing the file, success or failure.
async fn write_prompt_file(prompt: &str) -> Result<std::path::PathBuf, AmeliaError> {
    let path = std::env::temp_dir().join(format!("prompt-{}.txt", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, prompt)
        .await
        .map_err(|e| AmeliaError::Sandbox {
            operation: "write_prompt_file".to_string(),
            reason: e.to_string(),
        })?;
    Ok(path)
}

#[async_trait]
impl Driver for ContainerDriver {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        schema: Option<&Value>,
        session: Option<DriverSession>,
    ) -> Result<(GeneratedContent, DriverSession), AmeliaError> {
        self.provider.ensure_running().await?;

        let prompt_path = write_prompt_file(prompt).await?;
        let result = self.run_generate_worker(&prompt_path, system).await;
        let _ = tokio::fs::remove_file(&prompt_path).await;
        let last_line = result?;

        let value: Value =
            serde_json::from_str(&last_line).map_err(|e| AmeliaError::TransientProvider {
                provider: "container".to_string(),
                reason: format!("worker produced non-JSON output: {e}"),
            })?;
        if let Some(usage) = value.get("usage") {
            if let Ok(usage) = serde_json::from_value::<TokenUsage>(usage.clone()) {
                *self.usage.write().await = Some(usage);
            }
        }
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let content = match schema {
            None => GeneratedContent::Text(text),
            Some(schema) => {
                let structured: Value = serde_json::from_str(&text).map_err(|e| {
                    AmeliaError::SchemaValidation {
                        schema_name: schema
                            .get("title")
                            .and_then(Value::as_str)
                            .unwrap_or("unnamed")
                            .to_string(),
                        reason: format!("container driver response is not valid JSON: {e}"),
                    }
                })?;
                validate_against_schema(&structured, schema)?;
                GeneratedContent::Structured(structured)
            }
        };

        let next_session = session.unwrap_or_default();
        Ok((
            content,
            DriverSession {
                model: Some(self.model.clone()),
                ..next_session
            },
        ))
    }

    async fn execute_agentic(
        &self,
        prompt: &str,
        cwd: &Path,
        instructions: Option<&str>,
        allowed_tools: Option<&[String]>,
        session: Option<DriverSession>,
    ) -> Result<(AgenticStream, DriverSession), AmeliaError> {
        self.provider.ensure_running().await?;

        let request = json!({
            "mode": "agentic",
            "model": self.model,
            "prompt": prompt,
            "instructions": instructions,
            "allowed_tools": allowed_tools,
        });
        let command = vec![
            "amelia-worker".to_string(),
            "--request".to_string(),
            request.to_string(),
        ];
        let cwd_str = cwd.to_string_lossy().to_string();
        let mut raw_lines = self
            .provider
            .exec_stream(&command, Some(&cwd_str), None, None)
            .await?;

        let stream: AgenticStream = Box::pin(try_stream! {
            while let Some(line) = raw_lines.next().await {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    yield AgenticMessage::Text { text: line };
                    continue;
                };
                if let Some(message) = parse_agentic_line(&value) {
                    yield message;
                }
            }
        });

        let next_session = session.unwrap_or_default();
        Ok((
            stream,
            DriverSession {
                model: Some(self.model.clone()),
                ..next_session
            },
        ))
    }

    fn get_usage(&self) -> Option<TokenUsage> {
        self.usage.try_read().ok().and_then(|u| *u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_prompt_file_lands_under_the_system_temp_dir_with_unique_names() {
        let a = write_prompt_file("implement task one").await.unwrap();
        let b = write_prompt_file("implement task two").await.unwrap();

        assert_eq!(a.parent().unwrap(), std::env::temp_dir());
        assert_ne!(a, b);
        assert_eq!(tokio::fs::read_to_string(&a).await.unwrap(), "implement task one");

        tokio::fs::remove_file(&a).await.unwrap();
        tokio::fs::remove_file(&b).await.unwrap();
    }

    #[tokio::test]
    async fn prompt_file_is_removed_even_when_the_worker_call_fails() {
        let prompt_path = write_prompt_file("a prompt that will not survive").await.unwrap();
        assert!(tokio::fs::metadata(&prompt_path).await.is_ok());

        let worker_result: Result<String, AmeliaError> = Err(AmeliaError::Sandbox {
            operation: "exec_stream".to_string(),
            reason: "docker daemon unreachable".to_string(),
        });
        let _ = tokio::fs::remove_file(&prompt_path).await;
        assert!(worker_result.is_err());
        assert!(tokio::fs::metadata(&prompt_path).await.is_err());
    }
}
