//! Docker Engine API decoy (port 2375)
//!
//! Requests are routed by a fixed-priority table of patterns. `exec start`
//! upgrades the connection and hands it to [`relay`], which attaches a local
//! shell.

pub mod relay;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info};
use uuid::Uuid;

use super::acceptor::{accept_loop, ServiceTag};
use super::http::{self, HttpRequest, HttpResponse};
use super::{HandlerContext, Listening};
use crate::config::DockerConfig;
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

pub const DISPLAY_NAME: &str = "Docker 2375 decoy";

const API_VERSION: &str = "1.41";
const EXEC_ID: &str = "10026b3e684410026b3e684410026b3e";

/// What the dispatcher wants done with a request
#[derive(Debug)]
pub enum DockerAction {
    Respond(HttpResponse),
    /// Switch the connection to a raw stream attached to a shell
    Upgrade,
}

struct MockContainer {
    id: &'static str,
    name: &'static str,
    image: &'static str,
    status: &'static str,
    command: &'static str,
    created: i64,
    ports: &'static [(u16, u16)],
}

static CONTAINERS: &[MockContainer] = &[
    MockContainer {
        id: "a1b2c3d4e5f6",
        name: "/nginx-web-01",
        image: "nginx:1.23",
        status: "Up 2 days",
        command: "/docker-entrypoint.sh nginx -g 'daemon off;'",
        created: 1684567890,
        ports: &[(80, 80), (443, 443)],
    },
    MockContainer {
        id: "c3d4e5f6a1b2",
        name: "/nodejs-api",
        image: "node:18-alpine",
        status: "Up 1 day",
        command: "node server.js",
        created: 1684654290,
        ports: &[(3000, 3000)],
    },
    MockContainer {
        id: "f6a1b2c3d4e5",
        name: "/mysql-prod",
        image: "mysql:8.0",
        status: "Up 7 days",
        command: "--default-authentication-plugin=mysql_native_password",
        created: 1683966690,
        ports: &[(3306, 3306), (33060, 33060)],
    },
    MockContainer {
        id: "c3d4e5f6a1b3",
        name: "/redis-cache",
        image: "redis:alpine",
        status: "Up 8 days",
        command: "redis-server --requirepass secret",
        created: 1683880290,
        ports: &[(6379, 6379)],
    },
    MockContainer {
        id: "f6a1b2c3d4e7",
        name: "/jenkins",
        image: "jenkins/jenkins:lts",
        status: "Up 5 days",
        command: "/sbin/tini -- /usr/local/bin/jenkins.sh",
        created: 1684053090,
        ports: &[(8080, 8082), (50000, 50000)],
    },
    MockContainer {
        id: "a1b2c3d4e5fc",
        name: "/vault-server",
        image: "hashicorp/vault:1.13.3",
        status: "Up 1 day",
        command: "server -dev -dev-listen-address=0.0.0.0:8200",
        created: 1684654290,
        ports: &[(8200, 8200)],
    },
    MockContainer {
        id: "e5f6a1b2c3d8",
        name: "/failed-app",
        image: "python:3.10-slim",
        status: "Exited (1) 3 hours ago",
        command: "python app.py",
        created: 1684761090,
        ports: &[(5000, 5000)],
    },
];

impl MockContainer {
    fn state(&self) -> &'static str {
        if self.status.starts_with("Up") {
            "running"
        } else {
            "exited"
        }
    }

    fn summary(&self) -> Value {
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|(private, public)| json!({"IP": "0.0.0.0", "PrivatePort": private, "PublicPort": public, "Type": "tcp"}))
            .collect();
        json!({
            "Id": self.id,
            "Names": [self.name],
            "Image": self.image,
            "ImageID": format!("sha256:{}", image_id(self.image)),
            "Command": self.command,
            "Created": self.created,
            "Ports": ports,
            "Labels": {},
            "State": self.state(),
            "Status": self.status,
            "HostConfig": {"NetworkMode": "bridge"},
            "Mounts": []
        })
    }

    fn inspect(&self) -> Value {
        let created = Utc
            .timestamp_opt(self.created, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let running = self.state() == "running";
        let (pid, exit_code) = if running { (4242, 0) } else { (0, 1) };
        json!({
            "Id": self.id,
            "Created": created,
            "Path": self.command.split_whitespace().next().unwrap_or_default(),
            "Args": self.command.split_whitespace().skip(1).collect::<Vec<_>>(),
            "State": {
                "Status": self.state(),
                "Running": running,
                "Paused": false,
                "Restarting": false,
                "OOMKilled": false,
                "Dead": false,
                "Pid": pid,
                "ExitCode": exit_code,
                "Error": "",
                "StartedAt": created,
                "FinishedAt": "0001-01-01T00:00:00Z"
            },
            "Image": format!("sha256:{}", image_id(self.image)),
            "Name": self.name,
            "RestartCount": 0,
            "Driver": "overlay2",
            "Config": {"Image": self.image, "Tty": false, "OpenStdin": false},
            "HostConfig": {"NetworkMode": "bridge"},
            "Mounts": []
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Image {
    repo_tags: Vec<String>,
    id: String,
    created: i64,
    size: i64,
    virtual_size: i64,
}

/// Short image id derived from the repo tag, stable across restarts
fn image_id(repo_tag: &str) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, repo_tag.as_bytes());
    hex::encode(&digest.as_bytes()[..6])
}

fn initial_images() -> Vec<Image> {
    let mut images: Vec<Image> = Vec::new();
    let mut size = 100 * 1024 * 1024;
    for container in CONTAINERS {
        if images.iter().any(|image| image.repo_tags[0] == container.image) {
            continue;
        }
        images.push(Image {
            repo_tags: vec![container.image.to_string()],
            id: image_id(container.image),
            created: container.created,
            size,
            virtual_size: size * 2,
        });
        size += 10 * 1024 * 1024;
    }
    images
}

fn with_docker_headers(response: HttpResponse) -> HttpResponse {
    response
        .with_header("Api-Version", API_VERSION)
        .with_header("Docker-API-Version", API_VERSION)
        .with_header("Docker-Experimental", "false")
        .with_header("Ostype", "linux")
        .with_header("Server", "Docker/20.10.12 (linux)")
        .with_header("X-Content-Type-Options", "nosniff")
}

fn message(status: u16, text: &str) -> HttpResponse {
    HttpResponse::json(status, &json!({ "message": text }))
}

fn method_not_allowed() -> HttpResponse {
    message(405, "Method Not Allowed")
}

/// Request dispatcher for one Docker listener
///
/// Image tags added by `POST /images/{name}/tag` persist for the lifetime of
/// the listener and are visible to every session.
pub struct DockerRouter {
    image_delete: Regex,
    container_logs: Regex,
    image_tag: Regex,
    image_create: Regex,
    exec_resize: Regex,
    exec_create: Regex,
    exec_start: Regex,
    container_inspect: Regex,
    versioned: Regex,
    images: Mutex<Vec<Image>>,
}

impl DockerRouter {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            image_delete: Regex::new(r"^/v1\.\d+/images/([^/]+)$")?,
            container_logs: Regex::new(r"^/v1\.\d+/containers/([a-zA-Z0-9]+)/logs$")?,
            image_tag: Regex::new(r"^/v1\.\d+/images/([^/]+/[^/]+|[^/]+):([^/]+)/tag$")?,
            image_create: Regex::new(r"^/v1\.\d+/images/create$")?,
            exec_resize: Regex::new(r"^/v1\.\d+/exec/([^/]+)/resize$")?,
            exec_create: Regex::new(r"^/v1\.\d+/containers/([a-zA-Z0-9_.-]+)/exec$")?,
            exec_start: Regex::new(r"^/v1\.\d+/exec/([a-zA-Z0-9_.-]+)/start$")?,
            container_inspect: Regex::new(r"^/v\d+\.\d+/containers/([a-zA-Z0-9_\-.:]+)/json$")?,
            versioned: Regex::new(r"^/v\d+\.\d+(/.*)$")?,
            images: Mutex::new(initial_images()),
        })
    }

    pub fn route(&self, request: &HttpRequest) -> DockerAction {
        match self.dispatch(request) {
            DockerAction::Respond(response) => DockerAction::Respond(with_docker_headers(response)),
            DockerAction::Upgrade => DockerAction::Upgrade,
        }
    }

    fn dispatch(&self, request: &HttpRequest) -> DockerAction {
        let method = request.method.as_str();
        let path = request.path();

        if method == "DELETE" {
            if let Some(caps) = self.image_delete.captures(path) {
                return DockerAction::Respond(self.delete_image(&caps[1]));
            }
        }
        if self.container_logs.is_match(path) {
            return DockerAction::Respond(HttpResponse::new(200, "application/vnd.docker.multiplexed-stream", Vec::new()));
        }
        if let Some(caps) = self.image_tag.captures(path) {
            if method != "POST" {
                return DockerAction::Respond(method_not_allowed());
            }
            let source = format!("{}:{}", &caps[1], &caps[2]);
            return DockerAction::Respond(self.tag_image(&source, request.query_param("repo"), request.query_param("tag")));
        }
        if self.image_create.is_match(path) {
            return DockerAction::Respond(if method == "POST" {
                message(
                    500,
                    "Error response from daemon: Get \"https://registry-1.docker.io/v2/\": net/http: request canceled while waiting for connection (Client.Timeout exceeded while awaiting headers)",
                )
            } else {
                method_not_allowed()
            });
        }
        if self.exec_resize.is_match(path) {
            return DockerAction::Respond(if method == "POST" {
                HttpResponse::empty(200)
            } else {
                message(400, "invalid exec resize request")
            });
        }
        if let Some(caps) = self.exec_create.captures(path) {
            if method != "POST" {
                return DockerAction::Respond(method_not_allowed());
            }
            let id = &caps[1];
            return DockerAction::Respond(if find_container(id).is_some() {
                HttpResponse::json(201, &json!({ "Id": EXEC_ID }))
            } else {
                message(404, &format!("No such container: {}", id))
            });
        }
        if self.exec_start.is_match(path) {
            if method != "POST" {
                return DockerAction::Respond(method_not_allowed());
            }
            return DockerAction::Upgrade;
        }
        if let Some(caps) = self.container_inspect.captures(path) {
            if method != "GET" {
                return DockerAction::Respond(method_not_allowed());
            }
            let id = &caps[1];
            return DockerAction::Respond(match find_container(id) {
                Some(container) => HttpResponse::json(200, &container.inspect()),
                None => message(404, &format!("No such container: {}", id)),
            });
        }

        let endpoint = self
            .versioned
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map_or(path, |m| m.as_str());
        DockerAction::Respond(self.endpoint(method, endpoint))
    }

    fn endpoint(&self, method: &str, endpoint: &str) -> HttpResponse {
        let expected = match endpoint {
            "/_ping" => "GET",
            "/info" | "/version" | "/containers/json" | "/images/json" => "GET",
            "/containers/create" => "POST",
            _ => return message(404, "page not found"),
        };
        if method != expected && !(endpoint == "/_ping" && method == "HEAD") {
            return method_not_allowed();
        }

        match endpoint {
            "/_ping" => HttpResponse::text(200, "OK"),
            "/info" => HttpResponse::json(200, &self.info()),
            "/version" => HttpResponse::json(200, &version()),
            "/containers/json" => {
                let list: Vec<Value> = CONTAINERS.iter().map(MockContainer::summary).collect();
                HttpResponse::json(200, &Value::Array(list))
            }
            "/images/json" => {
                let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
                HttpResponse::json(200, &serde_json::to_value(&*images).unwrap_or_default())
            }
            _ => message(
                500,
                "failed to create task for container: failed to create shim task: OCI runtime create failed: runc create failed: unable to start container process: exec: \"bash\": executable file not found in $PATH: unknown",
            ),
        }
    }

    fn delete_image(&self, name: &str) -> HttpResponse {
        let (repo, tag) = name.split_once(':').unwrap_or((name, "latest"));
        let full = format!("{}:{}", repo, tag);
        let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        match images.iter().find(|image| image.repo_tags.iter().any(|t| *t == full)) {
            Some(image) => HttpResponse::json(200, &json!([{ "Deleted": image.id }])),
            None => message(404, &format!("No such image: {}", full)),
        }
    }

    fn tag_image(&self, source: &str, repo: Option<&str>, tag: Option<&str>) -> HttpResponse {
        let (repo, tag) = match (repo, tag) {
            (Some(repo), Some(tag)) if !repo.is_empty() && !tag.is_empty() => (repo, tag),
            _ => return message(400, "repo and tag parameters are required"),
        };
        let new_tag = format!("{}:{}", repo, tag);

        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        match images.iter_mut().find(|image| image.repo_tags.iter().any(|t| t == source)) {
            Some(image) => {
                if !image.repo_tags.contains(&new_tag) {
                    image.repo_tags.push(new_tag);
                }
                HttpResponse::empty(201)
            }
            None => message(404, &format!("Error response from daemon: No such image: {}", source)),
        }
    }

    fn info(&self) -> Value {
        let image_count = self.images.lock().map(|images| images.len()).unwrap_or_default();
        let running = CONTAINERS.iter().filter(|c| c.state() == "running").count();
        json!({
            "ID": "7TRN:IPZB:QYBB:VPBQ:UWYJ:KLSO:2UPH:4ESI:ABRL:JQUZ:PDQ3:GWD6",
            "Containers": CONTAINERS.len(),
            "ContainersRunning": running,
            "ContainersPaused": 0,
            "ContainersStopped": CONTAINERS.len() - running,
            "Images": image_count,
            "Driver": "overlay2",
            "DriverStatus": [["Backing Filesystem", "extfs"], ["Supports d_type", "true"]],
            "Plugins": {
                "Volume": ["local"],
                "Network": ["bridge", "host", "ipvlan", "macvlan", "null", "overlay"],
                "Log": ["json-file", "journald", "local", "syslog"]
            },
            "MemoryLimit": true,
            "SwapLimit": true,
            "OperatingSystem": "Ubuntu 22.04 LTS",
            "OSType": "linux",
            "Architecture": "x86_64",
            "KernelVersion": "5.15.0-78-generic",
            "NCPU": 4,
            "MemTotal": 16777216000u64,
            "SystemTime": Utc::now().to_rfc3339(),
            "LoggingDriver": "json-file",
            "CgroupDriver": "systemd",
            "CgroupVersion": "2",
            "IndexServerAddress": "https://index.docker.io/v1/",
            "DockerRootDir": "/var/lib/docker",
            "Name": "docker-host",
            "ServerVersion": "20.10.21",
            "DefaultRuntime": "runc",
            "Swarm": {"NodeID": "", "NodeAddr": "", "LocalNodeState": "inactive", "ControlAvailable": false},
            "SecurityOptions": ["name=apparmor", "name=seccomp,profile=builtin", "name=cgroupns"],
            "Warnings": ["WARNING: API is accessible on http://0.0.0.0:2375 without encryption."]
        })
    }
}

fn find_container(id_or_name: &str) -> Option<&'static MockContainer> {
    CONTAINERS
        .iter()
        .find(|c| c.id == id_or_name || c.name.trim_start_matches('/') == id_or_name)
}

fn version() -> Value {
    json!({
        "Platform": {"Name": "Docker Engine - Community"},
        "Components": [
            {"Name": "Engine", "Version": "20.10.21", "Details": {
                "ApiVersion": API_VERSION,
                "Arch": "amd64",
                "GoVersion": "go1.18.7",
                "KernelVersion": "5.15.0-78-generic",
                "MinAPIVersion": "1.12",
                "Os": "linux"
            }},
            {"Name": "containerd", "Version": "1.6.10", "Details": {"GitCommit": ""}},
            {"Name": "runc", "Version": "1.1.4", "Details": {"GitCommit": ""}}
        ],
        "Version": "20.10.21",
        "ApiVersion": API_VERSION,
        "MinAPIVersion": "1.12",
        "GitCommit": "3056208",
        "GoVersion": "go1.18.7",
        "Os": "linux",
        "Arch": "amd64",
        "KernelVersion": "5.15.0-78-generic",
        "BuildTime": "2022-10-25T18:00:04.000000000+00:00"
    })
}

fn upgrade_response() -> HttpResponse {
    HttpResponse::new(101, "application/vnd.docker.raw-stream", Vec::new())
        .with_header("Connection", "Upgrade")
        .with_header("Upgrade", "tcp")
        .with_header("Api-Version", API_VERSION)
        .with_header("Docker-API-Version", API_VERSION)
        .with_header("Server", "Docker/20.10.12 (linux)")
}

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let router = Arc::new(DockerRouter::new()?);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Docker honeypot started on {}", local_addr);

    let reporter = ctx.reporter.clone();
    let shell = Arc::new(ctx.docker.clone());
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Docker, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone(), router.clone(), shell.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter, router: Arc<DockerRouter>, shell: Arc<DockerConfig>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shared = Arc::new(session.clone());
    let fallback = router.clone();
    let default_answer = move || match fallback.route(&HttpRequest::default()) {
        DockerAction::Respond(response) => response,
        DockerAction::Upgrade => HttpResponse::empty(404),
    };
    http::serve_connection(stream, &session, default_answer, move |mut request: Request<Incoming>| {
        let session = shared.clone();
        let reporter = reporter.clone();
        let router = router.clone();
        let shell = shell.clone();
        async move {
            let upgrade = hyper::upgrade::on(&mut request);
            let request = HttpRequest::from_hyper(request).await;
            reporter.spawn_update(&session, format!("Method: {}, Path: {}", request.method, request.target));

            match router.route(&request) {
                DockerAction::Respond(response) => response.into_response(),
                DockerAction::Upgrade => {
                    tokio::spawn(attach(upgrade, session, reporter, shell));
                    upgrade_response().into_response()
                }
            }
        }
    })
    .await;
}

/// Run the shell relay once the 101 is on the wire
async fn attach(upgrade: OnUpgrade, session: Arc<Session>, reporter: Reporter, shell: Arc<DockerConfig>) {
    let upgraded = match upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            debug!("DOCKER upgrade from {} not completed: {}", session.remote_ip(), e);
            return;
        }
    };

    let (reader, writer) = tokio::io::split(TokioIo::new(upgraded));
    if let Err(e) = relay::run(reader, writer, &session, &reporter, &shell).await {
        debug!("DOCKER relay error for {}: {}", session.remote_ip(), e);
    }
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

    fn respond(router: &DockerRouter, method: &str, target: &str) -> (u16, Value, HttpResponse) {
        match router.route(&request(method, target)) {
            DockerAction::Respond(resp) => {
                let body = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
                (resp.status, body, resp)
            }
            DockerAction::Upgrade => panic!("unexpected upgrade for {} {}", method, target),
        }
    }

    #[test]
    fn every_response_carries_api_version() {
        let router = DockerRouter::new().unwrap();
        for (method, target) in [("GET", "/version"), ("GET", "/nope"), ("PUT", "/info")] {
            let (_, _, resp) = respond(&router, method, target);
            assert!(resp.headers.iter().any(|(k, v)| k == "Api-Version" && v == API_VERSION));
            assert!(resp.headers.iter().any(|(k, _)| k == "Docker-API-Version"));
        }
    }

    #[test]
    fn versioned_and_bare_paths_agree() {
        let router = DockerRouter::new().unwrap();
        let (status, bare, _) = respond(&router, "GET", "/containers/json");
        let (_, versioned, _) = respond(&router, "GET", "/v1.41/containers/json?all=1");
        assert_eq!(status, 200);
        assert_eq!(bare, versioned);
        assert_eq!(bare[0]["Id"], "a1b2c3d4e5f6");
    }

    #[test]
    fn unknown_path_and_wrong_method() {
        let router = DockerRouter::new().unwrap();
        let (status, body, _) = respond(&router, "GET", "/v1.41/swarm");
        assert_eq!(status, 404);
        assert_eq!(body, json!({"message": "page not found"}));

        let (status, body, _) = respond(&router, "DELETE", "/containers/json");
        assert_eq!(status, 405);
        assert_eq!(body["message"], "Method Not Allowed");

        let (status, _, _) = respond(&router, "GET", "/containers/create");
        assert_eq!(status, 405);
    }

    #[test]
    fn exec_create_then_start_upgrades() {
        let router = DockerRouter::new().unwrap();
        let (status, body, _) = respond(&router, "POST", "/v1.41/containers/a1b2c3d4e5f6/exec");
        assert_eq!(status, 201);
        assert_eq!(body["Id"], EXEC_ID);

        let (status, _, _) = respond(&router, "POST", "/v1.41/containers/ffffffffffff/exec");
        assert_eq!(status, 404);

        let start = format!("/v1.41/exec/{}/start", EXEC_ID);
        assert!(matches!(router.route(&request("POST", &start)), DockerAction::Upgrade));
        let (status, _, _) = respond(&router, "GET", &start);
        assert_eq!(status, 405);
    }

    #[test]
    fn inspect_known_and_unknown_containers() {
        let router = DockerRouter::new().unwrap();
        let (status, body, _) = respond(&router, "GET", "/v1.41/containers/mysql-prod/json");
        assert_eq!(status, 200);
        assert_eq!(body["Id"], "f6a1b2c3d4e5");
        assert_eq!(body["State"]["Running"], true);

        let (status, body, _) = respond(&router, "GET", "/v1.41/containers/nope/json");
        assert_eq!(status, 404);
        assert_eq!(body["message"], "No such container: nope");
    }

    #[test]
    fn tag_is_visible_to_delete() {
        let router = DockerRouter::new().unwrap();
        let (status, _, _) = respond(&router, "DELETE", "/v1.41/images/evil:latest");
        assert_eq!(status, 404);

        let (status, _, _) = respond(&router, "POST", "/v1.41/images/jenkins/jenkins:lts/tag?repo=evil&tag=latest");
        assert_eq!(status, 201);

        let (status, body, _) = respond(&router, "DELETE", "/v1.41/images/evil");
        assert_eq!(status, 200);
        assert_eq!(body[0]["Deleted"], image_id("jenkins/jenkins:lts"));
    }

    #[test]
    fn canned_failures() {
        let router = DockerRouter::new().unwrap();
        let (status, body, _) = respond(&router, "POST", "/v1.41/images/create?fromImage=alpine");
        assert_eq!(status, 500);
        assert!(body["message"].as_str().unwrap().contains("registry-1.docker.io"));

        let (status, _, _) = respond(&router, "POST", "/v1.41/containers/create");
        assert_eq!(status, 500);

        let (status, _, resp) = respond(&router, "GET", "/v1.41/containers/a1b2c3d4e5f6/logs?stdout=1");
        assert_eq!(status, 200);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn ping_over_the_wire() {
        use crate::report::testing::recording_reporter;
        use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

        let (reporter, recorded) = recording_reporter().await;
        let (mut client, server) = duplex(64 * 1024);
        let session = Session::new(ProtocolKind::Docker, DISPLAY_NAME, "192.0.2.7:4000", "9");
        let task = tokio::spawn(handle(
            server,
            session,
            reporter,
            Arc::new(DockerRouter::new().unwrap()),
            Arc::new(DockerConfig::default()),
        ));

        client
            .write_all(b"GET /_ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Api-Version: 1.41\r\n"));
        assert!(out.ends_with("\r\n\r\nOK"));
        let reports = recorded.wait_for(1).await;
        assert_eq!(reports[0]["info"], "Method: GET, Path: /_ping");
        assert_eq!(reports[0]["id"], "9");
    }

    #[tokio::test]
    async fn tls_hello_gets_page_not_found() {
        use crate::report::testing::recording_reporter;
        use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

        let (reporter, _) = recording_reporter().await;
        let (mut client, server) = duplex(64 * 1024);
        let session = Session::new(ProtocolKind::Docker, DISPLAY_NAME, "192.0.2.7:4000", "9");
        let task = tokio::spawn(handle(
            server,
            session,
            reporter,
            Arc::new(DockerRouter::new().unwrap()),
            Arc::new(DockerConfig::default()),
        ));

        client.write_all(b"\x16\x03\x01\x02\x00\x01\x00").await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        task.await.unwrap();

        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.contains("page not found"));
    }

    #[tokio::test]
    async fn exec_start_attaches_a_shell() {
        use crate::report::testing::recording_reporter;
        use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

        let (reporter, recorded) = recording_reporter().await;
        let (mut client, server) = duplex(64 * 1024);
        let session = Session::new(ProtocolKind::Docker, DISPLAY_NAME, "192.0.2.7:4000", "9");
        let shell = DockerConfig {
            exec_shell: "/bin/sh".to_string(),
            exec_args: Vec::new(),
        };
        tokio::spawn(handle(server, session, reporter, Arc::new(DockerRouter::new().unwrap()), Arc::new(shell)));

        let body = r#"{"Detach":false,"Tty":true}"#;
        let request = format!(
            "POST /v1.41/exec/{}/start HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            EXEC_ID,
            body.len(),
            body
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&seen).contains("\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "closed before the upgrade");
            seen.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&seen).starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

        client.write_all(b"echo $((6*7))\n").await.unwrap();
        while !String::from_utf8_lossy(&seen).contains("42\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "relay closed early");
            seen.extend_from_slice(&buf[..n]);
        }
        client.write_all(b"exit\n").await.unwrap();

        let reports = recorded.wait_for(2).await;
        assert!(reports.iter().any(|r| r["info"] == "&&echo $((6*7))"));
    }
}
