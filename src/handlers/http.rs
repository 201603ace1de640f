//! HTTP/1.1 serving for the API decoys
//!
//! hyper owns the framing (chunked bodies, keep-alive, upgrades); the decoys
//! only see collected [`HttpRequest`]s and answer with [`HttpResponse`]s.
//! A stream that does not open with a request line gets the decoy's answer to
//! an empty request instead of a 400.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::report::Reporter;
use crate::session::Session;

const MAX_BODY: usize = 1024 * 1024;

pub type Body = Full<Bytes>;

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    /// Raw request target, query included
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Target without the query string
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Collect a request off the wire. Bodies beyond 1 MiB are dropped.
    pub async fn from_hyper(request: Request<Incoming>) -> Self {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, MAX_BODY).collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(e) => {
                debug!("Request body for {} dropped: {}", parts.uri, e);
                Vec::new()
            }
        };

        Self {
            method: parts.method.to_string(),
            target: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            version: format!("{:?}", parts.version),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
                .collect(),
            body,
        }
    }

    /// One-line description used in reports
    pub fn summary(&self) -> String {
        if self.body.is_empty() {
            format!("{} {}", self.method, self.target)
        } else {
            format!("{} {} {}", self.method, self.target, String::from_utf8_lossy(&self.body))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        let body = serde_json::to_vec_pretty(value).unwrap_or_default();
        Self::new(status, "application/json", body)
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body)
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        for (name, value) in self.headers {
            match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => debug!("Skipping malformed response header"),
            }
        }
        response
    }

    /// Wire form for the pre-hyper fallback; the connection closes after it
    fn to_wire(&self) -> Vec<u8> {
        let reason = StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Whether buffered bytes can still be the start of an HTTP/1.x request
fn opens_like_request(head: &[u8]) -> bool {
    let method_len = head.iter().take_while(|b| b.is_ascii_uppercase()).count();
    if method_len == 0 {
        return false;
    }
    match head.get(method_len) {
        None => true,
        Some(b' ') => match head.iter().position(|&b| b == b'\n') {
            Some(end) => head[..end].windows(6).any(|w| w == b" HTTP/"),
            None => true,
        },
        Some(_) => false,
    }
}

/// Drive one HTTP/1.1 connection until the peer leaves.
///
/// Upgrades are enabled; a handler that answers 101 can take the connection
/// with `hyper::upgrade::on`. Header names go out in canonical case. Input
/// that is not HTTP is answered once with `fallback()` and closed.
pub async fn serve_connection<S, H, Fut, D>(stream: S, session: &Session, fallback: D, handler: H)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
    D: FnOnce() -> HttpResponse,
{
    let mut stream = BufReader::new(stream);
    let head = match stream.fill_buf().await {
        Ok(head) => head,
        Err(e) => {
            debug!("{} read from {} failed: {}", session.kind, session.remote_ip(), e);
            return;
        }
    };
    if head.is_empty() {
        return;
    }
    if !opens_like_request(head) {
        debug!("{} non-HTTP input from {}", session.kind, session.remote_ip());
        let wire = fallback().to_wire();
        if let Err(e) = stream.write_all(&wire).await {
            debug!("{} fallback to {} failed: {}", session.kind, session.remote_ip(), e);
        }
        let _ = stream.shutdown().await;
        return;
    }

    let service = service_fn(move |request: Request<Incoming>| {
        let response = handler(request);
        async move { Ok::<_, Infallible>(response.await) }
    });

    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    if let Err(e) = connection.await {
        debug!("{} connection from {} ended: {}", session.kind, session.remote_ip(), e);
    }
}

/// Serve decoys whose routing is a pure function.
///
/// Each request is reported before it is routed.
pub async fn serve<S, F>(stream: S, session: Session, reporter: Reporter, route: F)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    let route = Arc::new(route);
    let shared = Arc::new(session.clone());
    let fallback = route.clone();
    serve_connection(stream, &session, move || fallback(&HttpRequest::default()), move |request| {
        let route = route.clone();
        let session = shared.clone();
        let reporter = reporter.clone();
        async move {
            let request = HttpRequest::from_hyper(request).await;
            reporter.spawn_update(&session, request.summary());
            route(&request).into_response()
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::recording_reporter;
    use crate::session::ProtocolKind;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn echo(request: &HttpRequest) -> HttpResponse {
        let body = format!("{} {} {}", request.method, request.path(), String::from_utf8_lossy(&request.body));
        HttpResponse::text(200, &body).with_header("X-Query", request.query_param("x").unwrap_or("-"))
    }

    async fn exchange(raw: &[u8]) -> String {
        let (reporter, _) = recording_reporter().await;
        let (mut client, server) = duplex(64 * 1024);
        let session = Session::new(ProtocolKind::Kubelet, "test", "192.0.2.1:1000", "5");
        let task = tokio::spawn(serve(server, session, reporter, echo));

        client.write_all(raw).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    #[tokio::test]
    async fn content_length_body_and_query() {
        let out = exchange(b"POST /exec/abc/start?x=1 HTTP/1.1\r\nHost: a\r\ncontent-length: 4\r\nConnection: close\r\n\r\nbody").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("X-Query: 1\r\n"));
        assert!(out.ends_with("POST /exec/abc/start body"));
    }

    #[tokio::test]
    async fn chunked_body_then_second_request() {
        let out = exchange(
            b"POST /a HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n\
              GET /b HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.contains("POST /a Wikipedia"));
        assert!(out.ends_with("GET /b "));
    }

    #[tokio::test]
    async fn garbage_gets_the_default_answer() {
        let out = exchange(b"\x16\x03\x01garbage\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\n  "));
    }

    #[test]
    fn request_line_detection() {
        assert!(opens_like_request(b"GE"));
        assert!(opens_like_request(b"GET /x"));
        assert!(opens_like_request(b"POST /a HTTP/1.1\r\nHost: a\r\n"));
        assert!(!opens_like_request(b"\x16\x03\x01"));
        assert!(!opens_like_request(b"get / HTTP/1.1\r\n"));
        assert!(!opens_like_request(b"HELLO world\r\n"));
        assert!(!opens_like_request(b"SSH-2.0-OpenSSH\r\n"));
    }

    #[tokio::test]
    async fn requests_are_reported() {
        let (reporter, recorded) = recording_reporter().await;
        let (mut client, server) = duplex(4096);
        let session = Session::new(ProtocolKind::Etcd, "test", "192.0.2.1:1000", "5");
        let task = tokio::spawn(serve(server, session, reporter, echo));

        client
            .write_all(b"GET /v2/keys?x=2 HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();

        let reports = recorded.wait_for(1).await;
        assert_eq!(reports[0]["info"], "GET /v2/keys?x=2");
        assert_eq!(reports[0]["id"], "5");
    }

    #[test]
    fn response_conversion() {
        let response = HttpResponse::text(404, "404 page not found\n")
            .with_header("Bad Header", "x")
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");
        assert!(!response.headers().contains_key("bad header"));
    }
}
