//! Kubelet read-only API decoy (port 10255)

use std::sync::Arc;

use anyhow::Result;
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

pub const DISPLAY_NAME: &str = "Kubelet 10255 decoy";

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Kubelet honeypot started on {}", local_addr);

    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Kubelet, DISPLAY_NAME),
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
    let path = request.target.as_str();
    if path == "/" {
        return HttpResponse::text(404, "404 page not found\n");
    }

    let body = if path.starts_with("/pods") {
        pods()
    } else if path.starts_with("/nodes") {
        nodes()
    } else if path.starts_with("/healthz") {
        json!("ok")
    } else {
        json!({"availableEndpoints": "/pods, /nodes, /healthz"})
    };
    HttpResponse::json(200, &body)
}

fn nginx_containers() -> Value {
    json!([{"name": "nginx", "image": "nginx:1.14.2"}])
}

fn pods() -> Value {
    json!({
        "default/nginx-pod": {
            "metadata": {"name": "nginx-pod", "namespace": "default"},
            "spec": {"containers": nginx_containers()}
        }
    })
}

fn nodes() -> Value {
    json!({
        "node1.example.com": {
            "pods": [{
                "name": "nginx-pod",
                "namespace": "default",
                "containers": nginx_containers()
            }]
        }
    })
}
