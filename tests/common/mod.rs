//! In-process central server shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use honeypot_agent::client::ServerClient;
use honeypot_agent::config::Config;
use honeypot_agent::handlers::{HandlerContext, ServiceRegistry};
use honeypot_agent::identity::AgentIdentity;
use honeypot_agent::report::Reporter;

#[derive(Clone, Default)]
pub struct MockServer {
    pub results: Arc<Mutex<Vec<Value>>>,
    pub heartbeats: Arc<Mutex<Vec<Value>>>,
    pub task_updates: Arc<Mutex<Vec<Value>>>,
    pub alerts: Arc<Mutex<Vec<Value>>>,
    pub config: Arc<Mutex<Value>>,
    pub tasks: Arc<Mutex<Vec<Value>>>,
    pub labels: Arc<Mutex<Vec<Value>>>,
    /// Status updates still to be answered with HTTP 500
    pub failing_updates: Arc<AtomicUsize>,
    /// Label list requests still to be answered with HTTP 500
    pub failing_labels: Arc<AtomicUsize>,
    next_id: Arc<AtomicUsize>,
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({"code": 200, "msg": "success", "data": data}))
}

async fn result(State(state): State<MockServer>, Json(body): Json<Value>) -> Json<Value> {
    let id = if body["id"] == "0" {
        (state.next_id.fetch_add(1, Ordering::SeqCst) + 1000).to_string()
    } else {
        body["id"].as_str().unwrap_or_default().to_string()
    };
    state.results.lock().await.push(body);
    ok(json!(id))
}

async fn status(State(state): State<MockServer>, Json(body): Json<Value>) -> Json<Value> {
    state.heartbeats.lock().await.push(body);
    ok(Value::Null)
}

async fn config(State(state): State<MockServer>) -> Json<Value> {
    ok(state.config.lock().await.clone())
}

async fn tasks(State(state): State<MockServer>) -> Json<Value> {
    let tasks = state.tasks.lock().await.clone();
    ok(json!({ "tasks": tasks }))
}

async fn task_status(State(state): State<MockServer>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let failing = state
        .failing_updates
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"code": 500, "msg": "db down"})));
    }

    // A settled task is no longer handed out
    state.tasks.lock().await.retain(|t| t["id"] != body["task_id"]);
    state.task_updates.lock().await.push(body);
    (StatusCode::OK, ok(Value::Null))
}

async fn labels(State(state): State<MockServer>) -> (StatusCode, Json<Value>) {
    let failing = state
        .failing_labels
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"code": 500, "msg": "db down"})));
    }
    (StatusCode::OK, ok(Value::Array(state.labels.lock().await.clone())))
}

async fn alert(State(state): State<MockServer>, Json(body): Json<Value>) -> Json<Value> {
    state.alerts.lock().await.push(body);
    ok(Value::Null)
}

impl MockServer {
    /// Bind on an ephemeral port and return a reporter wired to it
    pub async fn start() -> (MockServer, Reporter) {
        let state = MockServer::default();
        let app = Router::new()
            .route("/api/v1/agent/result", post(result))
            .route("/api/v1/agent/status", post(status))
            .route("/api/v1/agent/honeypot/config", get(config))
            .route("/api/v1/agent/tasks", get(tasks))
            .route("/api/v1/agent/task/status", post(task_status))
            .route("/api/v1/secretlabel/agent/list", get(labels))
            .route("/api/v1/secretlabel/alert", post(alert))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = ServerClient::new(addr.to_string(), Duration::from_secs(5)).unwrap();
        let identity = AgentIdentity {
            agent_ip: "10.1.2.3".into(),
            agent_name: "it-agent".into(),
            hostname: "decoy-host".into(),
            node_type: "node".into(),
        };
        (state, Reporter::new(client, identity))
    }

    /// Poll until `count` result reports arrived
    pub async fn wait_for_results(&self, count: usize) -> Vec<Value> {
        wait_for(&self.results, count).await
    }

    pub async fn wait_for_alerts(&self, count: usize) -> Vec<Value> {
        wait_for(&self.alerts, count).await
    }
}

async fn wait_for(list: &Mutex<Vec<Value>>, count: usize) -> Vec<Value> {
    for _ in 0..300 {
        {
            let items = list.lock().await;
            if items.len() >= count {
                return items.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    list.lock().await.clone()
}

/// Config with every TCP decoy on an ephemeral loopback port and no accept delay
pub fn loopback_config() -> Config {
    let mut config = Config::default();
    config.pool.accept_delay_ms = 0;
    for service in [
        &mut config.services.ssh,
        &mut config.services.telnet,
        &mut config.services.ftp,
        &mut config.services.redis,
        &mut config.services.docker,
        &mut config.services.kubelet,
        &mut config.services.etcd,
        &mut config.services.apiserver,
        &mut config.services.http,
        &mut config.services.tftp,
        &mut config.services.elasticsearch,
    ] {
        service.addr = "127.0.0.1:0".to_string();
    }
    config
}

pub fn registry(config: &Config, reporter: Reporter) -> Arc<ServiceRegistry> {
    let ctx = Arc::new(HandlerContext::from_config(config, reporter));
    Arc::new(ServiceRegistry::from_config(config, ctx))
}
