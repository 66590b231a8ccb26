use std::collections::HashMap;
use std::process::Stdio;

use amelia_core::error::AmeliaError;
use async_stream::try_stream;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{generate_network_allowlist_script, LineStream, SandboxProvider};

/// Container lifecycle over the `docker` CLI, shelled out to via
/// `tokio::process::Command` — the same approach the pack uses for
/// managing auxiliary service containers (`docker stop`/`docker compose`
/// wrapped in `Command::new("docker")`), generalized here to running an
/// agent sandbox image (§4.3).
pub struct DockerSandboxProvider {
    container_name: String,
    image: String,
    proxy_host: String,
    network_allowlist_enabled: bool,
    allowed_hosts: Vec<String>,
}

impl DockerSandboxProvider {
    pub fn new(
        workflow_id: &str,
        image: String,
        proxy_host: String,
        network_allowlist_enabled: bool,
        allowed_hosts: Vec<String>,
    ) -> Self {
        Self {
            container_name: format!("amelia-sandbox-{workflow_id}"),
            image,
            proxy_host,
            network_allowlist_enabled,
            allowed_hosts,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn is_running(&self) -> Result<bool, AmeliaError> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", &self.container_name])
            .output()
            .await
            .map_err(docker_error("inspect"))?;
        Ok(output.status.success()
            && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn apply_network_allowlist(&self) -> Result<(), AmeliaError> {
        if !self.network_allowlist_enabled {
            return Ok(());
        }
        let script = generate_network_allowlist_script(&self.proxy_host, &self.allowed_hosts);
        let mut child = Command::new("docker")
            .args(["exec", "-i", &self.container_name, "sh"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(docker_error("exec sh"))?;

        {
            use tokio::io::AsyncWriteExt;
            let stdin = child.stdin.as_mut().ok_or_else(|| AmeliaError::Sandbox {
                operation: "network_allowlist".to_string(),
                reason: "no stdin handle on helper shell".to_string(),
            })?;
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(docker_error("write allowlist script"))?;
        }

        let status = child.wait().await.map_err(docker_error("wait allowlist script"))?;
        if !status.success() {
            return Err(AmeliaError::Sandbox {
                operation: "network_allowlist".to_string(),
                reason: format!("allowlist script exited with {status}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn ensure_running(&self) -> Result<(), AmeliaError> {
        if self.is_running().await? {
            return Ok(());
        }

        let output = Command::new("docker")
            .args([
                "run",
                "-d",
                "--name",
                &self.container_name,
                "--rm",
                &self.image,
                "sleep",
                "infinity",
            ])
            .output()
            .await
            .map_err(docker_error("run"))?;
        if !output.status.success() {
            return Err(AmeliaError::Sandbox {
                operation: "ensure_running".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        self.apply_network_allowlist().await
    }

    async fn exec_stream(
        &self,
        command: &[String],
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
        stdin: Option<&str>,
    ) -> Result<LineStream, AmeliaError> {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if let Some(cwd) = cwd {
            args.push("-w".to_string());
            args.push(cwd.to_string());
        }
        if let Some(env) = env {
            for (key, value) in env {
                args.push("-e".to_string());
                args.push(format!("{key}={value}"));
            }
        }
        args.push(self.container_name.clone());
        args.extend(command.iter().cloned());

        let mut proc = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(docker_error("exec"))?;

        if let Some(stdin_data) = stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut handle) = proc.stdin.take() {
                handle
                    .write_all(stdin_data.as_bytes())
                    .await
                    .map_err(docker_error("write exec stdin"))?;
            }
        } else {
            proc.stdin.take();
        }

        let stdout = proc.stdout.take().ok_or_else(|| AmeliaError::Sandbox {
            operation: "exec_stream".to_string(),
            reason: "no stdout handle on exec process".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let stream: LineStream = Box::pin(try_stream! {
            while let Some(line) = lines.next_line().await.map_err(docker_error("read exec stdout"))? {
                yield line;
            }
            let _ = proc.wait().await;
        });

        Ok(stream)
    }

    async fn teardown(&self) -> Result<(), AmeliaError> {
        let output = Command::new("docker")
            .args(["ps", "-a", "--filter", "name=amelia-sandbox-", "--format", "{{.Names}}"])
            .output()
            .await
            .map_err(docker_error("ps"))?;
        if !output.status.success() {
            tracing::warn!("docker not available, skipping sandbox teardown");
            return Ok(());
        }

        for name in String::from_utf8_lossy(&output.stdout).lines() {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let _ = Command::new("docker").args(["rm", "-f", name]).output().await;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, AmeliaError> {
        self.is_running().await
    }
}

fn docker_error(operation: &'static str) -> impl Fn(std::io::Error) -> AmeliaError {
    move |e| AmeliaError::Sandbox {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_namespaced_per_workflow() {
        let provider = DockerSandboxProvider::new(
            "wf-123",
            "amelia-sandbox:latest".to_string(),
            "127.0.0.1:8088".to_string(),
            false,
            vec![],
        );
        assert_eq!(provider.container_name(), "amelia-sandbox-wf-123");
    }
}
