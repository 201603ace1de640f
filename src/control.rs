//! Control-plane reconciliation
//!
//! Each tick sends a heartbeat, applies the server's desired service states
//! and runs any pending tasks. Nothing in a tick is fatal: every failure is
//! logged and the loop moves on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{Heartbeat, HoneypotConfig, Task, TaskStatus};
use crate::error::{ClientError, TaskError};
use crate::monitor::FileMonitor;
use crate::report::Reporter;
use crate::tasks::TaskExecutor;

/// Start or stop one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub agent_name: String,
    /// `start` or `stop`, informational
    pub action: String,
    pub service: String,
    /// `"0"` stop, `"1"` start, `"2"` start in extended mode
    pub status: String,
}

impl ControlCommand {
    pub fn new(agent_name: &str, service: &str, status: &str) -> Self {
        let action = if status == "0" { "stop" } else { "start" };
        Self {
            agent_name: agent_name.to_string(),
            action: action.to_string(),
            service: service.to_string(),
            status: status.to_string(),
        }
    }
}

/// Whatever owns the decoy listeners
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn apply(&self, command: &ControlCommand) -> Result<(), TaskError>;

    /// Service name -> `"1"` / `"0"`, sent with the heartbeat
    async fn statuses(&self) -> BTreeMap<String, String>;
}

/// The central server as seen by the control loop
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn fetch_config(&self, agent: &str) -> Result<HoneypotConfig, ClientError>;
    async fn fetch_tasks(&self, agent: &str) -> Result<Vec<Task>, ClientError>;
    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), ClientError>;
    async fn report_status(&self, services: BTreeMap<String, String>) -> Result<(), ClientError>;
}

#[async_trait]
impl ControlPlane for Reporter {
    async fn fetch_config(&self, agent: &str) -> Result<HoneypotConfig, ClientError> {
        self.client().fetch_config(agent).await
    }

    async fn fetch_tasks(&self, agent: &str) -> Result<Vec<Task>, ClientError> {
        self.client().fetch_tasks(agent).await
    }

    async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), ClientError> {
        self.client().update_task_status(task_id, status).await
    }

    async fn report_status(&self, services: BTreeMap<String, String>) -> Result<(), ClientError> {
        let identity = self.identity();
        let heartbeat = Heartbeat {
            agent_ip: identity.agent_ip.clone(),
            agent_name: identity.agent_name.clone(),
            host_name: identity.hostname.clone(),
            node_type: identity.node_type.clone(),
            services,
        };
        self.client().report_status(&heartbeat).await
    }
}

/// Commands for every service field set to `"1"` or `"0"`
pub fn commands_from_config(agent_name: &str, config: &HoneypotConfig) -> Vec<ControlCommand> {
    config
        .entries()
        .into_iter()
        .filter(|(_, value)| matches!(*value, "0" | "1"))
        .map(|(service, value)| ControlCommand::new(agent_name, service, value))
        .collect()
}

pub struct ControlLoop {
    agent_name: String,
    plane: Arc<dyn ControlPlane>,
    services: Arc<dyn ServiceControl>,
    tasks: TaskExecutor,
    monitor: Option<Arc<FileMonitor>>,
    interval: Duration,
}

impl ControlLoop {
    pub fn new(
        agent_name: impl Into<String>,
        plane: Arc<dyn ControlPlane>,
        services: Arc<dyn ServiceControl>,
        tasks: TaskExecutor,
        interval: Duration,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            plane,
            services,
            tasks,
            monitor: None,
            interval,
        }
    }

    /// Start this monitor on any tick that finds it stopped
    pub fn with_monitor(mut self, monitor: Arc<FileMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub async fn run(&self) {
        info!("Control loop started for agent {} every {:?}", self.agent_name, self.interval);
        loop {
            self.tick().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One reconciliation pass
    pub async fn tick(&self) {
        let statuses = self.services.statuses().await;
        if let Err(e) = self.plane.report_status(statuses).await {
            debug!("Heartbeat failed for 127.0.0.1: {}", e);
        }

        self.reconcile_services().await;
        self.run_tasks().await;
        self.arm_monitor().await;
    }

    async fn arm_monitor(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        match monitor.start().await {
            Ok(true) => info!("File monitor started with {} paths", monitor.watched_paths().await),
            Ok(false) => {}
            Err(e) => debug!("File monitor still down on 127.0.0.1: {}", e),
        }
    }

    async fn reconcile_services(&self) {
        let config = match self.plane.fetch_config(&self.agent_name).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Config fetch failed for 127.0.0.1: {}", e);
                return;
            }
        };
        if config.is_empty_update() {
            debug!("No service changes for {}", self.agent_name);
            return;
        }

        for command in commands_from_config(&self.agent_name, &config) {
            match self.services.apply(&command).await {
                Ok(()) => debug!("Applied {} {}", command.action, command.service),
                Err(TaskError::UnknownService(name)) => debug!("No local decoy for '{}'", name),
                Err(e) => warn!("Applying {} {} failed on 127.0.0.1: {}", command.action, command.service, e),
            }
        }
    }

    async fn run_tasks(&self) {
        let tasks = match self.plane.fetch_tasks(&self.agent_name).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Task fetch failed for 127.0.0.1: {}", e);
                return;
            }
        };

        for task in tasks {
            let status = match self.tasks.execute(&task).await {
                Ok(()) => {
                    info!("Task {} ({}) completed", task.id, task.kind);
                    TaskStatus::Completed
                }
                Err(e) => {
                    warn!("Task {} ({}) failed on 127.0.0.1: {}", task.id, task.kind, e);
                    TaskStatus::Failed
                }
            };
            // Not retried: the server hands the task out again on the next poll.
            if let Err(e) = self.plane.update_task_status(&task.id, status).await {
                warn!("Task {} status update failed for 127.0.0.1: {}", task.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_zero_and_one_become_commands() {
        let config: HoneypotConfig = serde_json::from_value(serde_json::json!({
            "ssh": "1",
            "redis": 0,
            "telnet": "2",
            "docker": "",
            "es": "1"
        }))
        .unwrap();

        let commands = commands_from_config("edge", &config);
        assert_eq!(
            commands,
            vec![
                ControlCommand::new("edge", "ssh", "1"),
                ControlCommand::new("edge", "redis", "0"),
                ControlCommand::new("edge", "es", "1"),
            ]
        );
        assert_eq!(commands[1].action, "stop");
    }
}
