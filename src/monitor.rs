//! Tamper monitor for secret label files
//!
//! Watches every label the server marks `monitor_tampering` and posts an
//! alert for each change the kernel reports on those paths. The watch sits on
//! the label's directory, so a file replaced by rename stays covered.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{SecretLabel, SecretLabelAlert};
use crate::report::Reporter;

#[derive(Debug, Clone)]
struct Watched {
    id: i64,
    name: String,
}

struct Active {
    _watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
    paths: usize,
}

impl Drop for Active {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

pub struct FileMonitor {
    reporter: Reporter,
    active: Mutex<Option<Active>>,
}

impl FileMonitor {
    pub fn new(reporter: Reporter) -> Self {
        Self {
            reporter,
            active: Mutex::new(None),
        }
    }

    /// Fetch labels and start watching. `Ok(false)` if already running.
    pub async fn start(&self) -> Result<bool> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(false);
        }
        *active = Some(self.watch_current().await?);
        Ok(true)
    }

    /// Drop all watches. Returns whether the monitor was running.
    pub async fn stop(&self) -> bool {
        let was_running = self.active.lock().await.take().is_some();
        if was_running {
            info!("File monitor stopped");
        }
        was_running
    }

    /// Re-fetch labels and replace the watch list, starting if needed
    pub async fn refresh(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let next = self.watch_current().await?;
        *active = Some(next);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn watched_paths(&self) -> usize {
        self.active.lock().await.as_ref().map_or(0, |a| a.paths)
    }

    async fn watch_current(&self) -> Result<Active> {
        let agent = self.reporter.identity().agent_name.clone();
        let labels = self.reporter.client().fetch_secret_labels(&agent).await?;
        self.watch(labels)
    }

    fn watch(&self, labels: Vec<SecretLabel>) -> Result<Active> {
        let targets = monitored(labels);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;

        let mut dirs = HashSet::new();
        let mut watched = HashMap::new();
        for (path, label) in targets {
            let Some(dir) = path.parent().filter(|dir| dir.is_dir()).map(Path::to_path_buf) else {
                warn!("Secret label directory for {} missing on 127.0.0.1, not watched", path.display());
                continue;
            };
            if !dirs.contains(&dir) {
                if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    warn!("Watch on {} failed on 127.0.0.1: {}", dir.display(), e);
                    continue;
                }
                dirs.insert(dir);
            }
            debug!("Watching {} for label {}", path.display(), label.name);
            watched.insert(path, label);
        }
        info!("File monitor watching {} paths", watched.len());

        let paths = watched.len();
        let forwarder = tokio::spawn(forward(rx, watched, self.reporter.clone()));
        Ok(Active {
            _watcher: watcher,
            forwarder,
            paths,
        })
    }
}

fn monitored(labels: Vec<SecretLabel>) -> Vec<(PathBuf, Watched)> {
    labels
        .into_iter()
        .filter(|label| label.monitor_tampering && !label.file_path.is_empty())
        .map(|label| {
            (
                PathBuf::from(&label.file_path),
                Watched {
                    id: label.id,
                    name: label.name,
                },
            )
        })
        .collect()
}

/// Human description of a change, `None` for pure reads
fn describe(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => Some("attributes changed"),
        EventKind::Modify(ModifyKind::Name(_)) => Some("renamed"),
        EventKind::Modify(_) => Some("modified"),
        EventKind::Remove(_) => Some("removed"),
        EventKind::Create(_) => Some("created"),
        _ => None,
    }
}

fn alert_for(reporter: &Reporter, label: &Watched, path: &Path, message: &str) -> SecretLabelAlert {
    let identity = reporter.identity();
    SecretLabelAlert {
        secret_label_id: label.id,
        secret_label_name: label.name.clone(),
        agent: identity.agent_name.clone(),
        ip: identity.agent_ip.clone(),
        access_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        access_content: format!("File: {}, Message: {}", path.display(), message),
    }
}

async fn forward(
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    watched: HashMap<PathBuf, Watched>,
    reporter: Reporter,
) {
    while let Some(event) = events.recv().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("File monitor error on 127.0.0.1: {}", e);
                continue;
            }
        };
        let Some(message) = describe(&event.kind) else {
            continue;
        };

        for path in &event.paths {
            let Some(label) = watched.get(path) else {
                continue;
            };
            warn!("Secret label {} touched: {} {}", label.name, path.display(), message);
            let alert = alert_for(&reporter, label, path, message);
            let reporter = reporter.clone();
            tokio::spawn(async move {
                if let Err(e) = reporter.client().report_secret_label_alert(&alert).await {
                    warn!("Secret label alert failed for 127.0.0.1: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};

    #[test]
    fn only_tamper_monitored_labels() {
        let labels = vec![
            SecretLabel {
                id: 1,
                name: "aws".into(),
                file_path: "/root/.aws/credentials".into(),
                monitor_tampering: true,
                ..Default::default()
            },
            SecretLabel {
                id: 2,
                name: "quiet".into(),
                file_path: "/root/.pgpass".into(),
                monitor_tampering: false,
                ..Default::default()
            },
            SecretLabel {
                id: 3,
                name: "no path".into(),
                monitor_tampering: true,
                ..Default::default()
            },
        ];
        let targets = monitored(labels);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, PathBuf::from("/root/.aws/credentials"));
        assert_eq!(targets[0].1.id, 1);
    }

    #[test]
    fn reads_are_not_tampering() {
        assert_eq!(describe(&EventKind::Access(AccessKind::Any)), None);
        assert_eq!(describe(&EventKind::Modify(ModifyKind::Data(DataChange::Content))), Some("modified"));
        assert_eq!(
            describe(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))),
            Some("attributes changed")
        );
        assert_eq!(describe(&EventKind::Remove(RemoveKind::File)), Some("removed"));
        assert_eq!(describe(&EventKind::Create(CreateKind::File)), Some("created"));
    }
}
