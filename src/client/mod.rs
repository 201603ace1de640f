//! HTTP client for the central server

pub mod types;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;
pub use types::*;

const RESULT_PATH: &str = "/api/v1/agent/result";
const STATUS_PATH: &str = "/api/v1/agent/status";
const CONFIG_PATH: &str = "/api/v1/agent/honeypot/config";
const TASKS_PATH: &str = "/api/v1/agent/tasks";
const TASK_STATUS_PATH: &str = "/api/v1/agent/task/status";
const LABEL_LIST_PATH: &str = "/api/v1/secretlabel/agent/list";
const LABEL_ALERT_PATH: &str = "/api/v1/secretlabel/alert";

#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(&base_url.into()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<ApiResponse<T>, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        decode(response).await
    }

    async fn get_for_agent<T>(&self, path: &str, agent: &str) -> Result<ApiResponse<T>, ClientError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(self.url(path))
            .query(&[("agent", agent)])
            .send()
            .await?;
        decode(response).await
    }

    /// Post one result report and return the id the server assigned
    pub async fn post_result(&self, report: &ResultReport) -> Result<String, ClientError> {
        let response: ApiResponse<Value> = self.post(RESULT_PATH, report).await?;
        let data = ok_data(response)?;
        Ok(match data {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        })
    }

    pub async fn report_status(&self, heartbeat: &Heartbeat) -> Result<(), ClientError> {
        let response: ApiResponse<Value> = self.post(STATUS_PATH, heartbeat).await?;
        ok_data(response).map(|_| ())
    }

    pub async fn fetch_config(&self, agent: &str) -> Result<HoneypotConfig, ClientError> {
        let response = self.get_for_agent(CONFIG_PATH, agent).await?;
        Ok(ok_data(response)?.unwrap_or_default())
    }

    pub async fn fetch_tasks(&self, agent: &str) -> Result<Vec<Task>, ClientError> {
        let response: ApiResponse<TaskList> = self.get_for_agent(TASKS_PATH, agent).await?;
        let tasks = ok_data(response)?.unwrap_or_default().tasks;
        debug!("Fetched {} tasks for agent {}", tasks.len(), agent);
        Ok(tasks)
    }

    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), ClientError> {
        let body = TaskStatusUpdate { task_id, status };
        let response: ApiResponse<Value> = self.post(TASK_STATUS_PATH, &body).await?;
        ok_data(response).map(|_| ())
    }

    pub async fn fetch_secret_labels(&self, agent: &str) -> Result<Vec<SecretLabel>, ClientError> {
        let response = self.get_for_agent(LABEL_LIST_PATH, agent).await?;
        Ok(ok_data(response)?.unwrap_or_default())
    }

    pub async fn report_secret_label_alert(&self, alert: &SecretLabelAlert) -> Result<(), ClientError> {
        let response: ApiResponse<Value> = self.post(LABEL_ALERT_PATH, alert).await?;
        ok_data(response).map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<ApiResponse<T>, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status(status.as_u16()));
    }
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

fn ok_data<T>(response: ApiResponse<T>) -> Result<Option<T>, ClientError> {
    if response.code != 200 {
        return Err(ClientError::Api {
            code: response.code,
            msg: response.msg,
        });
    }
    Ok(response.data)
}

/// Prefix `http://` when no scheme is given and drop trailing slashes
pub fn normalize_base_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}
