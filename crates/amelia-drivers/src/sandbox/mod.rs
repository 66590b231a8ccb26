pub mod docker;
pub mod proxy;

use std::collections::HashMap;
use std::pin::Pin;

use amelia_core::error::AmeliaError;
use async_trait::async_trait;
use futures::Stream;

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, AmeliaError>> + Send>>;

/// Transport-agnostic container protocol (§4.3). The default
/// implementation is Docker-backed (`docker::DockerSandboxProvider`);
/// the interface is kept narrow enough that a future Firecracker/gVisor
/// backend only needs to implement these four operations.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn ensure_running(&self) -> Result<(), AmeliaError>;

    async fn exec_stream(
        &self,
        command: &[String],
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
        stdin: Option<&str>,
    ) -> Result<LineStream, AmeliaError>;

    async fn teardown(&self) -> Result<(), AmeliaError>;

    async fn health_check(&self) -> Result<bool, AmeliaError>;
}

/// Builds the iptables script piped into the container-side helper at
/// startup (§4.3): flush OUTPUT, allow ESTABLISHED/RELATED, allow
/// loopback, allow DNS, resolve and allow the proxy host, resolve and
/// allow each configured host, final DROP. Hostnames are resolved with
/// `getent hosts` *inside* the generated script rather than at
/// generation time, so the allowlist survives DNS changes across
/// container restarts.
pub fn generate_network_allowlist_script(proxy_host: &str, allowed_hosts: &[String]) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str("set -e\n");
    script.push_str("iptables -F OUTPUT\n");
    script.push_str("iptables -P OUTPUT DROP\n");
    script.push_str("iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n");
    script.push_str("iptables -A OUTPUT -o lo -j ACCEPT\n");
    script.push_str("iptables -A OUTPUT -p udp --dport 53 -j ACCEPT\n");
    script.push_str("iptables -A OUTPUT -p tcp --dport 53 -j ACCEPT\n");

    script.push_str(&allow_host_block(proxy_host));
    for host in allowed_hosts {
        script.push_str(&allow_host_block(host));
    }

    script.push_str("iptables -A OUTPUT -j DROP\n");
    script
}

fn allow_host_block(host: &str) -> String {
    format!(
        "for ip in $(getent hosts {host} | awk '{{print $1}}'); do \
         iptables -A OUTPUT -d \"$ip\" -j ACCEPT; done\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_drops_by_default_and_allows_loopback_and_dns() {
        let script = generate_network_allowlist_script("proxy.local", &[]);
        assert!(script.contains("iptables -P OUTPUT DROP"));
        assert!(script.contains("-o lo -j ACCEPT"));
        assert!(script.contains("--dport 53"));
        assert!(script.ends_with("iptables -A OUTPUT -j DROP\n"));
    }

    #[test]
    fn script_resolves_proxy_and_every_allowed_host() {
        let script = generate_network_allowlist_script(
            "proxy.local",
            &["api.anthropic.com".to_string(), "github.com".to_string()],
        );
        assert!(script.contains("getent hosts proxy.local"));
        assert!(script.contains("getent hosts api.anthropic.com"));
        assert!(script.contains("getent hosts github.com"));
    }
}
