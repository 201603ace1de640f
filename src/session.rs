//! Per-connection session state

use serde::Serialize;
use std::fmt;

/// Report id the server has not assigned yet
pub const UNASSIGNED_ID: &str = "0";

/// Protocol tag sent as `type` in result reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolKind {
    Ssh,
    Telnet,
    Ftp,
    Redis,
    Docker,
    Etcd,
    Kubelet,
    Apiserver,
    Bash,
    Http,
    Tftp,
    Es,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Ssh => "SSH",
            ProtocolKind::Telnet => "TELNET",
            ProtocolKind::Ftp => "FTP",
            ProtocolKind::Redis => "REDIS",
            ProtocolKind::Docker => "DOCKER",
            ProtocolKind::Etcd => "ETCD",
            ProtocolKind::Kubelet => "KUBELET",
            ProtocolKind::Apiserver => "APISERVER",
            ProtocolKind::Bash => "BASH",
            ProtocolKind::Http => "HTTP",
            ProtocolKind::Tftp => "TFTP",
            ProtocolKind::Es => "ES",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attacker connection.
///
/// The report id comes from the "connected" report and never changes for the
/// lifetime of the session. A failed first report leaves it at `"0"`.
#[derive(Debug, Clone)]
pub struct Session {
    pub kind: ProtocolKind,
    /// Display name shown on the dashboard, e.g. "Docker 2375 decoy"
    pub name: String,
    pub remote_addr: String,
    id: String,
}

impl Session {
    pub fn new(kind: ProtocolKind, name: impl Into<String>, remote_addr: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind,
            name: name.into(),
            remote_addr: remote_addr.into(),
            id: if id.is_empty() { UNASSIGNED_ID.to_string() } else { id },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_report_id(&self) -> bool {
        self.id != UNASSIGNED_ID
    }

    /// Peer IP without the port
    pub fn remote_ip(&self) -> &str {
        peer_ip(&self.remote_addr)
    }
}

/// Strip the port from `ip:port` or `[v6]:port`. Unix peers have no port.
pub fn peer_ip(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((ip, port)) if !ip.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => ip,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_degrades_to_unassigned() {
        let session = Session::new(ProtocolKind::Redis, "Redis decoy", "10.0.0.5:40122", "");
        assert_eq!(session.id(), "0");
        assert!(!session.has_report_id());
        assert_eq!(session.remote_ip(), "10.0.0.5");
    }

    #[test]
    fn peer_ip_handles_v6_and_unix() {
        assert_eq!(peer_ip("[::1]:8080"), "::1");
        assert_eq!(peer_ip("fe80::1"), "fe80::1");
        assert_eq!(peer_ip("unix"), "unix");
    }

    #[test]
    fn wire_names() {
        assert_eq!(ProtocolKind::Apiserver.to_string(), "APISERVER");
        assert_eq!(serde_json::to_string(&ProtocolKind::Es).unwrap(), "\"ES\"");
    }
}
