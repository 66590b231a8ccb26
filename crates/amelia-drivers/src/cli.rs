use std::path::Path;
use std::process::Stdio;

use amelia_core::error::AmeliaError;
use amelia_types::{AgenticMessage, DriverSession, TokenUsage};
use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::driver::{validate_against_schema, AgenticStream, Driver, GeneratedContent};

/// Wraps a local command-line agent tool, invoked as
/// `$AMELIA_CLI_DRIVER_COMMAND <model>`, streaming its stdout lines into
/// `AgenticMessage` (§4.2). Each stdout line is parsed the way the
/// container driver parses worker output — a JSON object with a `type`
/// discriminant — since both share the same line-oriented wire shape.
pub struct CliDriver {
    model: String,
    command: String,
    usage: RwLock<Option<TokenUsage>>,
}

impl CliDriver {
    pub fn new(model: String) -> Self {
        let command = std::env::var("AMELIA_CLI_DRIVER_COMMAND")
            .unwrap_or_else(|_| "amelia-cli-agent".to_string());
        Self {
            model,
            command,
            usage: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Driver for CliDriver {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        schema: Option<&Value>,
        session: Option<DriverSession>,
    ) -> Result<(GeneratedContent, DriverSession), AmeliaError> {
        let mut command = Command::new(&self.command);
        command
            .arg("--model")
            .arg(&self.model)
            .arg("--prompt")
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(system) = system {
            command.arg("--system").arg(system);
        }

        let output = command.output().await.map_err(|e| AmeliaError::TransientProvider {
            provider: "cli".to_string(),
            reason: format!("failed to spawn `{}`: {e}", self.command),
        })?;

        if !output.status.success() {
            return Err(AmeliaError::TransientProvider {
                provider: "cli".to_string(),
                reason: format!(
                    "`{}` exited with {}: {}",
                    self.command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();

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
                        reason: format!("cli driver response is not valid JSON: {e}"),
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
        let mut command = Command::new(&self.command);
        command
            .current_dir(cwd)
            .arg("--model")
            .arg(&self.model)
            .arg("--agentic")
            .arg("--prompt")
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(instructions) = instructions {
            command.arg("--instructions").arg(instructions);
        }
        if let Some(tools) = allowed_tools {
            command.arg("--allowed-tools").arg(tools.join(","));
        }

        let mut child = command.spawn().map_err(|e| AmeliaError::TransientProvider {
            provider: "cli".to_string(),
            reason: format!("failed to spawn `{}`: {e}", self.command),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AmeliaError::TransientProvider {
            provider: "cli".to_string(),
            reason: "child process has no stdout handle".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let stream: AgenticStream = Box::pin(try_stream! {
            while let Some(line) = lines.next_line().await.map_err(|e| AmeliaError::TransientProvider {
                provider: "cli".to_string(),
                reason: e.to_string(),
            })? {
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
            let _ = child.wait().await;
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

/// Shared by the CLI and container drivers: both speak the same
/// line-oriented, `type`-discriminated JSON wire shape for agentic
/// output (§4.2).
pub(crate) fn parse_agentic_line(value: &Value) -> Option<AgenticMessage> {
    match value.get("type").and_then(Value::as_str)? {
        "thinking" => Some(AgenticMessage::Thinking {
            text: value.get("text")?.as_str()?.to_string(),
        }),
        "tool_call" => Some(AgenticMessage::ToolCall {
            name: value.get("name")?.as_str()?.to_string(),
            args: value.get("args").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(AgenticMessage::ToolResult {
            name: value.get("name")?.as_str()?.to_string(),
            result: value.get("result").cloned().unwrap_or(Value::Null),
        }),
        "text" => Some(AgenticMessage::Text {
            text: value.get("text")?.as_str()?.to_string(),
        }),
        "result" => Some(AgenticMessage::Result {
            content: value.get("content")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}
