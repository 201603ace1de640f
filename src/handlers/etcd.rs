//! etcd client API decoy (port 2379)
//!
//! Serves a static v2 key tree shaped like a small Kubernetes registry.

use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::info;

use super::acceptor::{accept_loop, ServiceTag};
use super::http::{self, HttpRequest, HttpResponse};
use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

pub const DISPLAY_NAME: &str = "Etcd 2379 decoy";

struct Entry {
    key: &'static str,
    value: &'static str,
    dir: bool,
    created: u64,
    modified: u64,
}

const fn dir(key: &'static str, index: u64) -> Entry {
    Entry { key, value: "", dir: true, created: index, modified: index }
}

const fn kv(key: &'static str, value: &'static str, created: u64, modified: u64) -> Entry {
    Entry { key, value, dir: false, created, modified }
}

static KEYS: &[Entry] = &[
    dir("/", 1),
    dir("/registry", 2),
    dir("/registry/namespaces", 3),
    kv("/registry/namespaces/default", "eyJraW5kIjoiTmFtZXNwYWNlIiwiYXBpVmVyc2lvbiI6InYxIiwibWV0YWRhdGEiOnsibmFtZSI6ImRlZmF1bHQifX0=", 4, 4),
    kv("/registry/namespaces/kube-system", "eyJraW5kIjoiTmFtZXNwYWNlIiwiYXBpVmVyc2lvbiI6InYxIiwibWV0YWRhdGEiOnsibmFtZSI6Imt1YmUtc3lzdGVtIn19", 5, 5),
    dir("/registry/pods", 6),
    kv("/registry/pods/default/nginx-78f5d695bd-2xqzk", "eyJraW5kIjoiUG9kIiwiYXBpVmVyc2lvbiI6InYxIiwibWV0YWRhdGEiOnsibmFtZSI6Im5naW54LTc4ZjVkNjk1YmQtMnhxemsiLCJuYW1lc3BhY2UiOiJkZWZhdWx0In0sInNwZWMiOnsiY29udGFpbmVycyI6W3sibmFtZSI6Im5naW54IiwiaW1hZ2UiOiJuZ2lueDoxLjIxLjAifV19fQ==", 7, 15),
    kv("/registry/pods/kube-system/kube-proxy-8z4m2", "eyJraW5kIjoiUG9kIiwiYXBpVmVyc2lvbiI6InYxIiwibWV0YWRhdGEiOnsibmFtZSI6Imt1YmUtcHJveHktOHo0bTIiLCJuYW1lc3BhY2UiOiJrdWJlLXN5c3RlbSJ9fQ==", 8, 16),
    dir("/registry/services", 9),
    kv("/registry/services/specs/default/kubernetes", "eyJraW5kIjoiU2VydmljZSIsImFwaVZlcnNpb24iOiJ2MSIsIm1ldGFkYXRhIjp7Im5hbWUiOiJrdWJlcm5ldGVzIiwibmFtZXNwYWNlIjoiZGVmYXVsdCJ9LCJzcGVjIjp7ImNsdXN0ZXJJUCI6IjEwLjk2LjAuMSIsInBvcnRzIjpbeyJwb3J0Ijo0NDN9XX19", 10, 10),
    dir("/registry/configmaps", 11),
    kv("/registry/configmaps/default/kube-root-ca.crt", "eyJraW5kIjoiQ29uZmlnTWFwIiwiYXBpVmVyc2lvbiI6InYxIiwibWV0YWRhdGEiOnsibmFtZSI6Imt1YmUtcm9vdC1jYS5jcnQifX0=", 12, 12),
    dir("/registry/secrets", 13),
    kv("/registry/secrets/default/default-token-5k7z8", "eyJraW5kIjoiU2VjcmV0IiwiYXBpVmVyc2lvbiI6InYxIiwibWV0YWRhdGEiOnsibmFtZSI6ImRlZmF1bHQtdG9rZW4tNWs3ejgifX0=", 14, 14),
];

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Node {
    key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    nodes: Vec<Node>,
    created_index: u64,
    modified_index: u64,
}

impl Node {
    fn leaf(entry: &Entry) -> Self {
        Node {
            key: entry.key.to_string(),
            value: entry.value.to_string(),
            dir: entry.dir,
            nodes: Vec::new(),
            created_index: entry.created,
            modified_index: entry.modified,
        }
    }
}

/// Look up `key` in the tree. Directories list their direct children.
fn lookup(key: &str) -> Option<Node> {
    let entry = KEYS.iter().find(|e| e.key == key)?;
    let mut node = Node::leaf(entry);
    if entry.dir {
        let prefix = if key == "/" { "/".to_string() } else { format!("{}/", key) };
        let depth = prefix.matches('/').count();
        node.nodes = KEYS
            .iter()
            .filter(|e| e.key != key && e.key.starts_with(&prefix) && e.key.matches('/').count() == depth)
            .map(|e| Node {
                value: String::new(),
                ..Node::leaf(e)
            })
            .collect();
    }
    Some(node)
}

pub struct EtcdRouter {
    keys_path: Regex,
}

impl EtcdRouter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            keys_path: Regex::new(r"^/v2/keys(/.*)?$")?,
        })
    }

    pub fn route(&self, request: &HttpRequest) -> HttpResponse {
        let path = request.path();

        if request.method == "GET" && self.keys_path.is_match(path) {
            let key = match path.strip_prefix("/v2/keys").unwrap_or(path) {
                "" => "/",
                k => k,
            };
            return match lookup(key) {
                Some(node) => HttpResponse::json(200, &json!({"action": "get", "node": node})),
                None => HttpResponse::json(
                    404,
                    &json!({"errorCode": 100, "message": "Key not found", "cause": key, "index": 8}),
                ),
            };
        }

        let body = match path {
            "/version" => json!({"etcdserver": "3.5.0", "etcdcluster": "3.5.0"}),
            "/health" => json!({"health": "true", "reason": ""}),
            "/metrics" => json!({
                "metrics": "# HELP etcd_server_leader_changes_seen_total Total number of leader changes seen."
            }),
            "/v3/members" => members(),
            _ => json!({
                "availableEndpoints": "/version, /health, /metrics, /v3/members, /v3/kv/range, /v3/kv/put"
            }),
        };
        HttpResponse::json(200, &body)
    }
}

fn members() -> Value {
    let member = |id: &str, n: u8| {
        json!({
            "ID": id,
            "name": format!("etcd-{}", n),
            "peerURLs": [format!("http://127.0.0.{}:2380", n)],
            "clientURLs": [format!("http://127.0.0.{}:2379", n)],
        })
    };
    json!({
        "members": [
            member("123456789abcdef0", 1),
            member("abcdef0123456789", 2),
            member("0123456789abcdef", 3),
        ]
    })
}

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let router = Arc::new(EtcdRouter::new()?);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Etcd honeypot started on {}", local_addr);

    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Etcd, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone(), router.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter, router: Arc<EtcdRouter>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http::serve(stream, session, reporter, move |req| router.route(req)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, target: &str) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".into(),
            ..Default::default()
        }
    }

    fn body(resp: &HttpResponse) -> Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[test]
    fn root_lists_registry() {
        let router = EtcdRouter::new().unwrap();
        let resp = router.route(&request("GET", "/v2/keys"));
        assert_eq!(resp.status, 200);
        let json = body(&resp);
        assert_eq!(json["action"], "get");
        assert_eq!(json["node"]["dir"], true);
        assert_eq!(json["node"]["nodes"][0]["key"], "/registry");
        assert_eq!(json["node"]["nodes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn registry_children_are_one_level_deep() {
        let node = lookup("/registry").unwrap();
        let keys: Vec<_> = node.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(
            keys,
            ["/registry/namespaces", "/registry/pods", "/registry/services", "/registry/configmaps", "/registry/secrets"]
        );
    }

    #[test]
    fn leaf_carries_value() {
        let router = EtcdRouter::new().unwrap();
        let json = body(&router.route(&request("GET", "/v2/keys/registry/namespaces/default")));
        assert!(json["node"]["value"].as_str().unwrap().starts_with("eyJ"));
        assert!(json["node"].get("dir").is_none());
    }

    #[test]
    fn missing_key_is_error_100() {
        let router = EtcdRouter::new().unwrap();
        let resp = router.route(&request("GET", "/v2/keys/nope"));
        assert_eq!(resp.status, 404);
        let json = body(&resp);
        assert_eq!(json["errorCode"], 100);
        assert_eq!(json["cause"], "/nope");
    }

    #[test]
    fn fixed_endpoints_and_default() {
        let router = EtcdRouter::new().unwrap();
        assert_eq!(body(&router.route(&request("GET", "/version")))["etcdserver"], "3.5.0");
        assert_eq!(body(&router.route(&request("GET", "/v3/members")))["members"][2]["name"], "etcd-3");
        let json = body(&router.route(&request("PUT", "/v2/keys/x")));
        assert!(json["availableEndpoints"].as_str().unwrap().contains("/v3/kv/put"));
    }
}
