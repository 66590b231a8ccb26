use std::path::Path;
use std::str;

use amelia_core::error::AmeliaError;
use amelia_types::{AgenticMessage, DriverSession, TokenUsage};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::driver::{validate_against_schema, AgenticStream, Driver, GeneratedContent};

/// Direct LLM API over HTTP, OpenAI-compatible wire format. Grounded in
/// the teacher's `OpenAICompatibleProvider::complete`/`stream` — same
/// request shape, same SSE framing — generalized to the driver
/// abstraction's `generate`/`execute_agentic` pair and an optional
/// `base_url` override so the sandbox can route requests through its
/// local proxy (§4.2, §4.3).
pub struct ApiDriver {
    model: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
    usage: RwLock<Option<TokenUsage>>,
}

impl ApiDriver {
    pub fn new(model: String) -> Self {
        Self::with_base_url(model, default_base_url_for_model())
    }

    /// Used by the container driver's `ApiDriver` path to route through
    /// `http://127.0.0.1:<proxy_port>/proxy/v1` instead of the public API.
    pub fn with_base_url(model: String, base_url: String) -> Self {
        Self {
            model,
            base_url,
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            client: Client::new(),
            usage: RwLock::new(None),
        }
    }
}

/// Honors the same `AMELIA_UPSTREAM_BASE_URL` override the sandbox proxy
/// resolver reads (`sandbox::proxy::EnvProxyResolver`), so an unsandboxed
/// `ApiDriver` can be pointed at a test double without a profile field for
/// it.
fn default_base_url_for_model() -> String {
    std::env::var("AMELIA_UPSTREAM_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string())
}

#[async_trait]
impl Driver for ApiDriver {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        schema: Option<&Value>,
        session: Option<DriverSession>,
    ) -> Result<(GeneratedContent, DriverSession), AmeliaError> {
        let mut req_body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(system) = system {
            req_body["system"] = json!(system);
        }

        let mut req = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .json(&req_body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let response = req.send().await.map_err(|e| AmeliaError::TransientProvider {
            provider: "api".to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| AmeliaError::TransientProvider {
                provider: "api".to_string(),
                reason: e.to_string(),
            })?;

        if !status.is_success() {
            return Err(AmeliaError::TransientProvider {
                provider: "api".to_string(),
                reason: format!("request failed with status {status}"),
            });
        }

        if let Some(usage) = extract_usage(&value) {
            *self.usage.write().await = Some(usage);
        }

        let text = value["content"][0]["text"].as_str().unwrap_or("").to_string();

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
                        reason: format!("driver response is not valid JSON: {e}"),
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
        _cwd: &Path,
        instructions: Option<&str>,
        _allowed_tools: Option<&[String]>,
        session: Option<DriverSession>,
    ) -> Result<(AgenticStream, DriverSession), AmeliaError> {
        let mut req_body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "stream": true,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(instructions) = instructions {
            req_body["system"] = json!(instructions);
        }

        let mut req = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .json(&req_body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req.send().await.map_err(|e| AmeliaError::TransientProvider {
            provider: "api".to_string(),
            reason: e.to_string(),
        })?;

        let mut bytes = resp.bytes_stream();
        let stream: AgenticStream = Box::pin(try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| AmeliaError::TransientProvider {
                    provider: "api".to_string(),
                    reason: e.to_string(),
                })?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        let Ok(value) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };
                        match value.get("type").and_then(Value::as_str).unwrap_or_default() {
                            "content_block_delta" => {
                                if let Some(text) = value
                                    .get("delta")
                                    .and_then(|d| d.get("text"))
                                    .and_then(Value::as_str)
                                {
                                    yield AgenticMessage::Text { text: text.to_string() };
                                }
                                if let Some(thinking) = value
                                    .get("delta")
                                    .and_then(|d| d.get("thinking"))
                                    .and_then(Value::as_str)
                                {
                                    yield AgenticMessage::Thinking { text: thinking.to_string() };
                                }
                            }
                            "message_stop" => {
                                yield AgenticMessage::Result { content: String::new() };
                            }
                            _ => {}
                        }
                    }
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

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}
