//! Open HTTP proxy decoy
//!
//! Looks like a forward proxy, records every request and forwards nothing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::IntoResponse,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{HandlerContext, Listening};
use crate::report::Reporter;
use crate::session::ProtocolKind;

pub const DISPLAY_NAME: &str = "HTTP proxy decoy";

pub fn proxy_info(uri: &str, method: &str, remote: &SocketAddr) -> String {
    format!("URL:{}&&Method:{}&&RemoteAddr:{}", uri, method, remote)
}

async fn proxy_request(
    State(reporter): State<Reporter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> impl IntoResponse {
    let info = proxy_info(&request.uri().to_string(), request.method().as_str(), &addr);
    info!("HTTP proxy {} {} from {}", request.method(), request.uri(), addr.ip());
    reporter.spawn_created(ProtocolKind::Http, DISPLAY_NAME, &addr.ip().to_string(), info);

    (
        StatusCode::BAD_GATEWAY,
        [("Proxy-Agent", "squid/4.10")],
        "<html><head><title>502 Bad Gateway</title></head><body><h1>Bad Gateway</h1></body></html>",
    )
}

pub fn router(reporter: Reporter) -> Router {
    Router::new().fallback(proxy_request).with_state(reporter)
}

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("HTTP proxy honeypot started on {}", local_addr);

    let app = router(ctx.reporter.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = served {
            warn!("HTTP proxy server error on 127.0.0.1: {}", e);
        }
    });

    Ok(Listening::new(local_addr, task).with_shutdown(shutdown_tx))
}
