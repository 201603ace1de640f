//! Kubernetes API server decoy (port 6443, plain HTTP)

use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
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

pub const DISPLAY_NAME: &str = "Apiserver 6443 decoy";

const API_GROUPS: &[(&str, &str)] = &[
    ("apps", "v1"),
    ("batch", "v1"),
    ("rbac.authorization.k8s.io", "v1"),
    ("storage.k8s.io", "v1"),
    ("policy", "v1"),
    ("apiextensions.k8s.io", "v1"),
    ("certificates.k8s.io", "v1"),
];

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Apiserver honeypot started on {}", local_addr);

    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Apiserver, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http::serve(stream, session, reporter, route).await;
}

pub fn route(request: &HttpRequest) -> HttpResponse {
    let path = request.path();

    if ["/healthz", "/livez", "/readyz"].iter().any(|p| path.starts_with(p)) {
        return HttpResponse::new(200, "text/plain", "ok");
    }

    let body = match path {
        "/" => root_paths(),
        "/api" => json!({
            "kind": "APIVersions",
            "versions": ["v1"],
            "serverAddressByClientCIDRs": [{"clientCIDR": "0.0.0.0/0", "serverAddress": "127.0.0.1:6443"}]
        }),
        "/api/v1" => core_resources(),
        "/apis" | "/apis/" => api_group_list(),
        "/version" => json!({
            "major": "1",
            "minor": "21",
            "gitVersion": "v1.21.0",
            "gitTreeState": "clean",
            "goVersion": "go1.16.1",
            "compiler": "gc",
            "platform": "linux/amd64"
        }),
        "/api/v1/pods" => pod_list(&["default", "kube-system"]),
        p if p.starts_with("/api/v1/nodes") => node_list(),
        p => match namespaced_pods(p) {
            Some(ns) => pod_list(&[ns]),
            None => not_found(),
        },
    };

    let status = if body["kind"] == "Status" { 404 } else { 200 };
    HttpResponse::json(status, &body)
}

/// `/api/v1/namespaces/<ns>/pods` -> `<ns>`
fn namespaced_pods(path: &str) -> Option<&str> {
    let ns = path.strip_prefix("/api/v1/namespaces/")?.strip_suffix("/pods")?;
    (!ns.is_empty() && !ns.contains('/')).then_some(ns)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn pod(name: &str, namespace: &str, image: &str) -> Value {
    json!({
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            "creationTimestamp": now(),
        },
        "spec": {"containers": [{"name": name.split('-').next().unwrap_or(name), "image": image}]},
        "status": {"phase": "Running"}
    })
}

fn pod_list(namespaces: &[&str]) -> Value {
    let items: Vec<Value> = namespaces
        .iter()
        .flat_map(|ns| match *ns {
            "default" => vec![pod("nginx-deployment-76bf4969df-2bsk9", ns, "nginx:1.14.2")],
            "kube-system" => vec![
                pod("coredns-558bd4d5db-7xk2p", ns, "k8s.gcr.io/coredns/coredns:v1.8.0"),
                pod("kube-proxy-8z4m2", ns, "k8s.gcr.io/kube-proxy:v1.21.0"),
            ],
            _ => Vec::new(),
        })
        .collect();

    json!({
        "kind": "PodList",
        "apiVersion": "v1",
        "metadata": {"resourceVersion": "20523975"},
        "items": items
    })
}

fn node_list() -> Value {
    json!({
        "kind": "NodeList",
        "apiVersion": "v1",
        "metadata": {"selfLink": "/api/v1/nodes", "resourceVersion": "67890"},
        "items": [{
            "metadata": {
                "name": "node1.example.com",
                "uid": "b2c3d4e5-f6a7-5b6c-0d1e-8f9a0b1c2d3e",
                "creationTimestamp": now(),
            },
            "status": {"nodeInfo": {"kubeletVersion": "v1.21.0", "operatingSystem": "linux"}}
        }]
    })
}

fn core_resources() -> Value {
    let resources: Vec<Value> = ["pods", "nodes", "namespaces", "services", "secrets", "configmaps"]
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "namespaced": !matches!(*name, "nodes" | "namespaces"),
                "kind": kind_of(name),
                "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"]
            })
        })
        .collect();
    json!({"kind": "APIResourceList", "groupVersion": "v1", "resources": resources})
}

fn kind_of(resource: &str) -> String {
    let singular = resource.trim_end_matches('s');
    match singular {
        "configmap" => "ConfigMap".to_string(),
        s => {
            let mut chars = s.chars();
            chars
                .next()
                .map(|c| c.to_ascii_uppercase().to_string() + chars.as_str())
                .unwrap_or_default()
        }
    }
}

fn api_group_list() -> Value {
    let groups: Vec<Value> = API_GROUPS
        .iter()
        .map(|(name, version)| {
            let gv = format!("{}/{}", name, version);
            json!({
                "name": name,
                "versions": [{"groupVersion": gv, "version": version}],
                "preferredVersion": {"groupVersion": gv, "version": version}
            })
        })
        .collect();
    json!({"kind": "APIGroupList", "apiVersion": "v1", "groups": groups})
}

fn root_paths() -> Value {
    let mut paths = vec![
        "/.well-known/openid-configuration".to_string(),
        "/api".to_string(),
        "/api/v1".to_string(),
        "/apis".to_string(),
        "/apis/".to_string(),
    ];
    for (name, version) in API_GROUPS {
        paths.push(format!("/apis/{}", name));
        paths.push(format!("/apis/{}/{}", name, version));
    }
    paths.extend(["/healthz", "/livez", "/readyz", "/metrics", "/version"].map(String::from));
    json!({"paths": paths})
}

fn not_found() -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": "not found",
        "reason": "NotFound",
        "code": 404
    })
}
