//! Remotely issued tasks

use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::client::{SecretLabel, Task};
use crate::control::{ControlCommand, ServiceControl};
use crate::error::{io_err, TaskError};
use crate::monitor::FileMonitor;

/// Prefixes a secret label may never be written under
const DENYLIST: &[&str] = &[
    "/etc/crontab",
    "/etc/cron.d/",
    "/etc/cron.hourly/",
    "/etc/cron.daily/",
    "/etc/cron.weekly/",
    "/etc/cron.monthly/",
    "/var/spool/cron/",
    "/etc/passwd",
    "/etc/shadow",
    "/etc/group",
    "/etc/sudoers",
    "/etc/ssh/",
    "/etc/sysctl.conf",
    "/etc/network/interfaces",
    "/bin/",
    "/sbin/",
    "/usr/bin/",
    "/usr/sbin/",
    "/usr/local/bin/",
    "/usr/local/sbin/",
    "/etc/init.d/",
    "/etc/systemd/system/",
    "/etc/rc.d/",
    "/etc/rc.local",
    "/boot/",
    "/proc/",
    "/sys/",
    "/dev/",
    "/var/tmp/",
];

pub struct TaskExecutor {
    agent_name: String,
    services: Arc<dyn ServiceControl>,
    monitor: Option<Arc<FileMonitor>>,
}

impl TaskExecutor {
    pub fn new(agent_name: impl Into<String>, services: Arc<dyn ServiceControl>) -> Self {
        Self {
            agent_name: agent_name.into(),
            services,
            monitor: None,
        }
    }

    /// Refresh this monitor's watch list after each new secret label
    pub fn with_monitor(mut self, monitor: Arc<FileMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub async fn execute(&self, task: &Task) -> Result<(), TaskError> {
        match task.kind.as_str() {
            "service" => self.service_task(task).await,
            "secret_label" => self.secret_label_task(task).await,
            other => Err(TaskError::Unsupported(other.to_string())),
        }
    }

    async fn service_task(&self, task: &Task) -> Result<(), TaskError> {
        let status = match task.action.as_str() {
            "start" => "1",
            "stop" => "0",
            other => return Err(TaskError::Unsupported(format!("service action {}", other))),
        };
        let command = ControlCommand::new(&self.agent_name, &task.service, status);
        self.services.apply(&command).await
    }

    async fn secret_label_task(&self, task: &Task) -> Result<(), TaskError> {
        let label: SecretLabel = match task.params.get("task_data") {
            Some(Value::String(raw)) => serde_json::from_str(raw)?,
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())?,
            _ => return Err(TaskError::MissingTaskData),
        };

        create_secret_label_file(&label.file_path, &label.file_content)?;
        info!("Secret label {} written to {}", label.name, label.file_path);

        if let Some(monitor) = &self.monitor {
            if let Err(e) = monitor.refresh().await {
                warn!("File monitor refresh failed for 127.0.0.1: {}", e);
            }
        }
        Ok(())
    }
}

/// `path` with `.` and repeated separators collapsed. `None` for relative
/// paths or any `..` component.
fn normalized(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return None,
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn is_denied(path: &Path) -> bool {
    let text = path.to_string_lossy();
    DENYLIST.iter().any(|prefix| {
        text.starts_with(prefix) || prefix.strip_suffix('/').is_some_and(|dir| text == dir)
    })
}

/// Write a decoy credential file.
///
/// Refuses relative paths, `..` traversal, denylisted system locations and
/// existing symlinks, without touching the filesystem. Missing parent
/// directories are created `0755`; the file is written `0644`.
pub fn create_secret_label_file(path: &str, content: &str) -> Result<(), TaskError> {
    let unsafe_path = || TaskError::UnsafePath(PathBuf::from(path));
    if path.contains("../") {
        return Err(unsafe_path());
    }
    let target = normalized(Path::new(path)).ok_or_else(unsafe_path)?;
    if is_denied(&target) {
        return Err(unsafe_path());
    }

    match std::fs::symlink_metadata(&target) {
        Ok(meta) if meta.file_type().is_symlink() => return Err(unsafe_path()),
        Ok(meta) if meta.is_dir() => return Err(unsafe_path()),
        _ => {}
    }

    let parent = target.parent().ok_or_else(unsafe_path)?;
    // A symlinked parent could still land the file somewhere denied.
    if let (Ok(real_parent), Some(name)) = (parent.canonicalize(), target.file_name()) {
        if is_denied(&real_parent.join(name)) {
            return Err(unsafe_path());
        }
    }

    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(parent)
        .map_err(|e| io_err(parent, e))?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&target)
        .map_err(|e| io_err(&target, e))?;
    file.write_all(content.as_bytes()).map_err(|e| io_err(&target, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn rejects_unsafe_paths() {
        for path in [
            "relative/creds.txt",
            "/opt/app/../../etc/cron.d/job",
            "/opt/app/..",
            "/etc/passwd",
            "/etc/cron.d/backdoor",
            "//etc/shadow",
            "/etc/./ssh/authorized",
            "/usr/local/bin/tool",
            "/var/tmp/x",
            "/proc",
        ] {
            assert!(
                matches!(create_secret_label_file(path, "x"), Err(TaskError::UnsafePath(_))),
                "{} should be rejected",
                path
            );
        }
    }

    #[test]
    fn rejects_symlinks_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.txt");
        std::fs::write(&real, b"original").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let result = create_secret_label_file(link.to_str().unwrap(), "planted");
        assert!(matches!(result, Err(TaskError::UnsafePath(_))));
        assert_eq!(std::fs::read_to_string(&real).unwrap(), "original");
    }

    #[test]
    fn writes_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("opt/app/.aws/credentials");
        create_secret_label_file(target.to_str().unwrap(), "[default]\naws_access_key_id=AKIA").unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "[default]\naws_access_key_id=AKIA");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o644, 0o644);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ControlCommand>>);

    #[async_trait]
    impl ServiceControl for Recorder {
        async fn apply(&self, command: &ControlCommand) -> Result<(), TaskError> {
            self.0.lock().unwrap().push(command.clone());
            if command.service == "mysql" {
                return Err(TaskError::UnknownService(command.service.clone()));
            }
            Ok(())
        }

        async fn statuses(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    fn task(value: Value) -> Task {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn service_tasks_become_commands() {
        let services = Arc::new(Recorder::default());
        let executor = TaskExecutor::new("edge", services.clone());

        executor
            .execute(&task(json!({"id": 1, "type": "service", "action": "stop", "service": "redis"})))
            .await
            .unwrap();
        assert!(executor
            .execute(&task(json!({"id": 2, "type": "service", "action": "start", "service": "mysql"})))
            .await
            .is_err());
        assert!(matches!(
            executor
                .execute(&task(json!({"id": 3, "type": "service", "action": "restart", "service": "ssh"})))
                .await,
            Err(TaskError::Unsupported(_))
        ));

        let seen = services.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].status, "0");
        assert_eq!(seen[1].status, "1");
    }

    #[tokio::test]
    async fn secret_label_task() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("db/.pgpass");
        let label = json!({
            "id": 7,
            "name": "pg creds",
            "file_path": target.to_str().unwrap(),
            "file_content": "db:5432:*:admin:hunter2",
            "monitor_tampering": true
        });
        let executor = TaskExecutor::new("edge", Arc::new(Recorder::default()));

        executor
            .execute(&task(json!({"id": "9", "type": "secret_label", "params": {"task_data": label.to_string()}})))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "db:5432:*:admin:hunter2");

        assert!(matches!(
            executor.execute(&task(json!({"id": "10", "type": "secret_label", "params": {}}))).await,
            Err(TaskError::MissingTaskData)
        ));
        assert!(matches!(
            executor
                .execute(&task(json!({"id": "11", "type": "secret_label", "params": {"task_data": "{not json"}})))
                .await,
            Err(TaskError::Payload(_))
        ));
    }

    #[tokio::test]
    async fn command_and_config_tasks_are_refused() {
        let executor = TaskExecutor::new("edge", Arc::new(Recorder::default()));
        for kind in ["command", "config", "reboot"] {
            let result = executor.execute(&task(json!({"id": 1, "type": kind}))).await;
            assert!(matches!(result, Err(TaskError::Unsupported(_))));
        }
    }
}
