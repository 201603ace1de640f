//! Wire types exchanged with the central server

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Envelope wrapping every server response
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Body of `POST /api/v1/agent/result`
#[derive(Debug, Clone, Serialize)]
pub struct ResultReport {
    pub agent_ip: String,
    pub agent_name: String,
    pub hostname: String,
    pub node_type: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub project_name: String,
    pub source_ip: String,
    pub info: String,
    pub id: String,
}

/// Body of `POST /api/v1/agent/status`
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub agent_ip: String,
    pub agent_name: String,
    pub host_name: String,
    pub node_type: String,
    /// Service name -> "1" running / "0" stopped
    #[serde(flatten)]
    pub services: BTreeMap<String, String>,
}

/// Desired service states. Missing and empty fields mean "no change".
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HoneypotConfig {
    #[serde(deserialize_with = "loose_string")]
    pub web: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub deep: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub ssh: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub redis: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub mysql: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub http: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub telnet: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub ftp: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub mem_cahe: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub plug: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub es: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub tftp: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub vnc: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub custom: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub kubelet: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub etcd: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub apiserver: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub docker: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub bash: Option<String>,
}

impl HoneypotConfig {
    /// `(service name, desired status)` for every field with a value
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("web", &self.web),
            ("deep", &self.deep),
            ("ssh", &self.ssh),
            ("redis", &self.redis),
            ("mysql", &self.mysql),
            ("http", &self.http),
            ("telnet", &self.telnet),
            ("ftp", &self.ftp),
            ("memcache", &self.mem_cahe),
            ("plug", &self.plug),
            ("es", &self.es),
            ("tftp", &self.tftp),
            ("vnc", &self.vnc),
            ("custom", &self.custom),
            ("kubelet", &self.kubelet),
            ("etcd", &self.etcd),
            ("apiserver", &self.apiserver),
            ("docker", &self.docker),
            ("bash", &self.bash),
        ]
        .into_iter()
        .filter_map(|(name, value)| match value.as_deref() {
            Some(v) if !v.is_empty() => Some((name, v)),
            _ => None,
        })
        .collect()
    }

    /// True when the server signalled "no change"
    pub fn is_empty_update(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Accept `"1"`, `1`, `null` or absent. Empty strings become `None`.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(if b { "1" } else { "0" }.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskList {
    pub tasks: Vec<Task>,
}

/// A task issued by the server
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Task {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub service: String,
    pub params: serde_json::Map<String, Value>,
    pub created_at: String,
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusUpdate<'a> {
    pub task_id: &'a str,
    pub status: TaskStatus,
}

/// A canary file definition
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretLabel {
    pub id: i64,
    pub name: String,
    pub label_type: String,
    pub file_path: String,
    pub file_content: String,
    pub agent_type: String,
    pub agent_list: String,
    pub monitor_tampering: bool,
    pub create_time: String,
    pub update_time: String,
}

/// Body of `POST /api/v1/secretlabel/alert`
#[derive(Debug, Clone, Serialize)]
pub struct SecretLabelAlert {
    pub secret_label_id: i64,
    pub secret_label_name: String,
    pub agent: String,
    pub ip: String,
    /// `YYYY-MM-DD HH:MM:SS`, local time
    pub access_time: String,
    pub access_content: String,
}
