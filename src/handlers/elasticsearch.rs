//! Elasticsearch REST decoy

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{HandlerContext, Listening};
use crate::report::Reporter;
use crate::session::ProtocolKind;

pub const DISPLAY_NAME: &str = "ES 9200 decoy";

fn record(reporter: &Reporter, addr: &SocketAddr, method: &Method, uri: &str) {
    reporter.spawn_created(ProtocolKind::Es, DISPLAY_NAME, &addr.ip().to_string(), format!("{} {}", method, uri));
}

async fn cluster_banner(State(reporter): State<Reporter>, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Json<serde_json::Value> {
    record(&reporter, &addr, &Method::GET, "/");
    Json(json!({
        "name": "es-node-1",
        "cluster_name": "elasticsearch",
        "cluster_uuid": "x7N1pWl3QoCsKk0Zc7uZ0Q",
        "version": {
            "number": "7.10.2",
            "build_flavor": "default",
            "build_type": "docker",
            "build_hash": "747e1cc71def077253878a59143c1f785afa92b9",
            "build_date": "2021-01-13T00:42:12.435326Z",
            "build_snapshot": false,
            "lucene_version": "8.7.0",
            "minimum_wire_compatibility_version": "6.8.0",
            "minimum_index_compatibility_version": "6.0.0-beta1"
        },
        "tagline": "You Know, for Search"
    }))
}

async fn cat_indices(State(reporter): State<Reporter>, ConnectInfo(addr): ConnectInfo<SocketAddr>, request: Request) -> &'static str {
    record(&reporter, &addr, request.method(), &request.uri().to_string());
    ""
}

async fn not_found(State(reporter): State<Reporter>, ConnectInfo(addr): ConnectInfo<SocketAddr>, request: Request) -> Response {
    let uri = request.uri().to_string();
    record(&reporter, &addr, request.method(), &uri);
    let index = request.uri().path().trim_start_matches('/').split('/').next().unwrap_or_default().to_string();
    let body = json!({
        "error": {
            "root_cause": [{
                "type": "index_not_found_exception",
                "reason": format!("no such index [{}]", index),
                "index": index
            }],
            "type": "index_not_found_exception",
            "reason": format!("no such index [{}]", index),
            "index": index
        },
        "status": 404
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

pub fn router(reporter: Reporter) -> Router {
    Router::new()
        .route("/", get(cluster_banner))
        .route("/_cat/indices", get(cat_indices))
        .fallback(not_found)
        .with_state(reporter)
}

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Elasticsearch honeypot started on {}", local_addr);

    let app = router(ctx.reporter.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = served {
            warn!("Elasticsearch server error on 127.0.0.1: {}", e);
        }
    });

    Ok(Listening::new(local_addr, task).with_shutdown(shutdown_tx))
}
