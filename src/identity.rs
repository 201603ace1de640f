//! Agent identity: primary IP, hostname and node type

use std::net::{IpAddr, UdpSocket};
use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_ip: String,
    pub agent_name: String,
    pub hostname: String,
    pub node_type: String,
}

impl AgentIdentity {
    pub fn detect(agent_name: &str) -> Self {
        Self {
            agent_ip: primary_ipv4().unwrap_or_default(),
            agent_name: agent_name.to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            node_type: node_type().to_string(),
        }
    }
}

/// First non-loopback IPv4 address, found by routing a UDP socket outward.
/// Nothing is sent.
pub fn primary_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

/// "k8s" inside a cluster, "container" inside a container, otherwise "node"
pub fn node_type() -> &'static str {
    let cgroup = std::fs::read_to_string("/proc/self/cgroup").unwrap_or_default();
    classify(
        std::env::var("KUBERNETES_SERVICE_HOST").ok().as_deref(),
        &cgroup,
        Path::new("/.dockerenv").exists(),
    )
}

fn classify(kube_host: Option<&str>, cgroup: &str, dockerenv: bool) -> &'static str {
    if kube_host.is_some_and(|h| !h.is_empty()) {
        return "k8s";
    }
    if cgroup.contains("kube") || cgroup.contains("containerd") || dockerenv {
        return "container";
    }
    "node"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_precedence() {
        assert_eq!(classify(Some("10.96.0.1"), "", false), "k8s");
        assert_eq!(classify(Some(""), "0::/system.slice/containerd.service", false), "container");
        assert_eq!(classify(None, "0::/", true), "container");
        assert_eq!(classify(None, "0::/init.scope", false), "node");
    }
}
