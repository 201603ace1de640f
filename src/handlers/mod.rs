//! Decoy services and their lifecycle

pub mod acceptor;
pub mod apiserver;
pub mod bash;
pub mod docker;
pub mod elasticsearch;
pub mod etcd;
pub mod ftp;
pub mod http;
pub mod http_proxy;
pub mod kubelet;
pub mod redis;
pub mod shell;
pub mod ssh;
pub mod telnet;
pub mod tftp;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, DockerConfig, EmulationConfig};
use crate::control::{ControlCommand, ServiceControl};
use crate::error::TaskError;
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::ProtocolKind;

/// Upper bound on a graceful HTTP server shutdown before it is aborted
const GRACEFUL_STOP: Duration = Duration::from_secs(5);

/// Everything a decoy needs at start time
pub struct HandlerContext {
    pub reporter: Reporter,
    pub emulation: EmulationConfig,
    pub docker: DockerConfig,
    pub pool_capacity: usize,
    pub accept_delay: Duration,
}

impl HandlerContext {
    pub fn from_config(config: &Config, reporter: Reporter) -> Self {
        Self {
            reporter,
            emulation: config.emulation.clone(),
            docker: config.docker.clone(),
            pool_capacity: config.pool.capacity,
            accept_delay: Duration::from_millis(config.pool.accept_delay_ms),
        }
    }
}

/// A running decoy listener
pub struct Listening {
    local_addr: String,
    task: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
    socket_file: Option<PathBuf>,
    pool: Option<WorkerPool>,
}

impl Listening {
    pub fn new(local_addr: String, task: JoinHandle<()>) -> Self {
        Self {
            local_addr,
            task,
            shutdown: None,
            socket_file: None,
            pool: None,
        }
    }

    /// Drain this pool on stop; its pending accepts hold the listener
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Remove this file once the listener has stopped
    pub fn with_socket_file(mut self, path: PathBuf) -> Self {
        self.socket_file = Some(path);
        self
    }

    /// Stop by signalling `shutdown` instead of aborting straight away
    pub fn with_shutdown(mut self, shutdown: oneshot::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop serving. Returns once the listening socket is closed.
    pub async fn stop(self) {
        let Listening {
            local_addr,
            mut task,
            shutdown,
            socket_file,
            pool,
        } = self;

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
            if tokio::time::timeout(GRACEFUL_STOP, &mut task).await.is_err() {
                warn!("Graceful stop of {} timed out, aborting", local_addr);
                task.abort();
                let _ = task.await;
            }
        } else {
            task.abort();
            let _ = task.await;
        }

        if let Some(pool) = pool {
            pool.release().await;
        }

        if let Some(path) = socket_file {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed socket {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Socket cleanup failed on 127.0.0.1: {}: {}", path.display(), e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    Ssh,
    Telnet,
    Ftp,
    Redis,
    Docker,
    Kubelet,
    Etcd,
    Apiserver,
    Bash,
    Http,
    Tftp,
    Elasticsearch,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 12] = [
        ServiceKind::Ssh,
        ServiceKind::Telnet,
        ServiceKind::Ftp,
        ServiceKind::Redis,
        ServiceKind::Docker,
        ServiceKind::Kubelet,
        ServiceKind::Etcd,
        ServiceKind::Apiserver,
        ServiceKind::Bash,
        ServiceKind::Http,
        ServiceKind::Tftp,
        ServiceKind::Elasticsearch,
    ];

    /// Name used in configuration, control commands and heartbeats
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Ssh => "ssh",
            ServiceKind::Telnet => "telnet",
            ServiceKind::Ftp => "ftp",
            ServiceKind::Redis => "redis",
            ServiceKind::Docker => "docker",
            ServiceKind::Kubelet => "kubelet",
            ServiceKind::Etcd => "etcd",
            ServiceKind::Apiserver => "apiserver",
            ServiceKind::Bash => "bash",
            ServiceKind::Http => "http",
            ServiceKind::Tftp => "tftp",
            ServiceKind::Elasticsearch => "elasticsearch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        if name == "es" {
            return Some(ServiceKind::Elasticsearch);
        }
        ServiceKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn protocol(&self) -> ProtocolKind {
        match self {
            ServiceKind::Ssh => ProtocolKind::Ssh,
            ServiceKind::Telnet => ProtocolKind::Telnet,
            ServiceKind::Ftp => ProtocolKind::Ftp,
            ServiceKind::Redis => ProtocolKind::Redis,
            ServiceKind::Docker => ProtocolKind::Docker,
            ServiceKind::Kubelet => ProtocolKind::Kubelet,
            ServiceKind::Etcd => ProtocolKind::Etcd,
            ServiceKind::Apiserver => ProtocolKind::Apiserver,
            ServiceKind::Bash => ProtocolKind::Bash,
            ServiceKind::Http => ProtocolKind::Http,
            ServiceKind::Tftp => ProtocolKind::Tftp,
            ServiceKind::Elasticsearch => ProtocolKind::Es,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Desired state of a service: `"0"`, `"1"` or `"2"` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Off,
    On,
    /// Running with the extended interaction (login exchange on the shells)
    Extended,
}

impl ServiceStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "0" => Some(ServiceStatus::Off),
            "1" => Some(ServiceStatus::On),
            "2" => Some(ServiceStatus::Extended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Off => "0",
            ServiceStatus::On => "1",
            ServiceStatus::Extended => "2",
        }
    }
}

struct DescriptorState {
    addr: String,
    listening: Option<Listening>,
}

impl DescriptorState {
    fn is_running(&self) -> bool {
        self.listening.as_ref().is_some_and(|l| !l.is_finished())
    }
}

struct Descriptor {
    configured: Option<ServiceStatus>,
    state: Mutex<DescriptorState>,
}

/// One descriptor per decoy; each holds at most one listener.
///
/// Start and stop on the same service are serialized by the descriptor's
/// lock, so the control loop and manual commands cannot race.
pub struct ServiceRegistry {
    ctx: Arc<HandlerContext>,
    descriptors: BTreeMap<ServiceKind, Descriptor>,
}

impl ServiceRegistry {
    pub fn from_config(config: &Config, ctx: Arc<HandlerContext>) -> Self {
        let descriptors = ServiceKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let service = config.services.get(kind.name())?;
                let configured = ServiceStatus::parse(&service.status);
                if configured.is_none() {
                    warn!("Ignoring status '{}' for {} on 127.0.0.1", service.status, kind);
                }
                Some((
                    kind,
                    Descriptor {
                        configured,
                        state: Mutex::new(DescriptorState {
                            addr: service.addr,
                            listening: None,
                        }),
                    },
                ))
            })
            .collect();

        Self { ctx, descriptors }
    }

    fn descriptor(&self, kind: ServiceKind) -> Option<&Descriptor> {
        self.descriptors.get(&kind)
    }

    /// Start with the configured mode. `Ok(false)` if already running.
    pub async fn start(&self, kind: ServiceKind) -> Result<bool> {
        let extended = self
            .descriptor(kind)
            .is_some_and(|d| d.configured == Some(ServiceStatus::Extended));
        self.start_mode(kind, extended).await
    }

    pub async fn start_mode(&self, kind: ServiceKind, extended: bool) -> Result<bool> {
        let Some(descriptor) = self.descriptor(kind) else {
            anyhow::bail!("no descriptor for {}", kind);
        };
        let mut state = descriptor.state.lock().await;
        if state.is_running() {
            debug!("{} already running on {}", kind, state.addr);
            return Ok(false);
        }

        let listening = launch(kind, &state.addr, extended, self.ctx.clone()).await.map_err(|e| {
            warn!("{} failed to start on {}: {}", kind, state.addr, e);
            e
        })?;
        info!("{} listening on {}", kind, listening.local_addr());
        state.listening = Some(listening);
        Ok(true)
    }

    /// Stop a service. Returns whether it was running.
    pub async fn stop(&self, kind: ServiceKind) -> bool {
        let Some(descriptor) = self.descriptor(kind) else {
            return false;
        };
        let mut state = descriptor.state.lock().await;
        let was_running = state.is_running();
        if let Some(listening) = state.listening.take() {
            listening.stop().await;
            info!("{} stopped", kind);
        }
        was_running
    }

    /// Bound address of a running service
    pub async fn local_addr(&self, kind: ServiceKind) -> Option<String> {
        let state = self.descriptor(kind)?.state.lock().await;
        state
            .listening
            .as_ref()
            .filter(|l| !l.is_finished())
            .map(|l| l.local_addr().to_string())
    }

    pub async fn is_running(&self, kind: ServiceKind) -> bool {
        match self.descriptor(kind) {
            Some(descriptor) => descriptor.state.lock().await.is_running(),
            None => false,
        }
    }

    /// Service name -> `"1"` running / `"0"` stopped
    pub async fn statuses(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (kind, descriptor) in &self.descriptors {
            let running = descriptor.state.lock().await.is_running();
            out.insert(kind.name().to_string(), if running { "1" } else { "0" }.to_string());
        }
        out
    }

    /// Start every service configured on. Failures are logged and skipped.
    pub async fn start_enabled(&self) -> usize {
        let mut started = 0;
        for (kind, descriptor) in &self.descriptors {
            match descriptor.configured {
                Some(ServiceStatus::On) | Some(ServiceStatus::Extended) => {}
                _ => continue,
            }
            if let Ok(true) = self.start(*kind).await {
                started += 1;
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        for kind in self.descriptors.keys() {
            self.stop(*kind).await;
        }
    }
}

#[async_trait]
impl ServiceControl for ServiceRegistry {
    async fn apply(&self, command: &ControlCommand) -> Result<(), TaskError> {
        let Some(kind) = ServiceKind::from_name(&command.service) else {
            warn!("Control command for unknown service '{}' on 127.0.0.1", command.service);
            return Err(TaskError::UnknownService(command.service.clone()));
        };

        match ServiceStatus::parse(&command.status) {
            Some(ServiceStatus::Off) => {
                self.stop(kind).await;
                Ok(())
            }
            Some(status) => self
                .start_mode(kind, status == ServiceStatus::Extended)
                .await
                .map(|_| ())
                .map_err(|e| TaskError::ServiceStart {
                    service: kind.name().to_string(),
                    reason: e.to_string(),
                }),
            None => {
                warn!("Control command for {} has unknown status '{}'", kind, command.status);
                Err(TaskError::InvalidStatus(command.status.clone()))
            }
        }
    }

    async fn statuses(&self) -> BTreeMap<String, String> {
        ServiceRegistry::statuses(self).await
    }
}

async fn launch(kind: ServiceKind, addr: &str, extended: bool, ctx: Arc<HandlerContext>) -> Result<Listening> {
    match kind {
        ServiceKind::Ssh => ssh::start(addr, ctx, extended).await,
        ServiceKind::Telnet => telnet::start(addr, ctx, extended).await,
        ServiceKind::Ftp => ftp::start(addr, ctx).await,
        ServiceKind::Redis => redis::start(addr, ctx).await,
        ServiceKind::Docker => docker::start(addr, ctx).await,
        ServiceKind::Kubelet => kubelet::start(addr, ctx).await,
        ServiceKind::Etcd => etcd::start(addr, ctx).await,
        ServiceKind::Apiserver => apiserver::start(addr, ctx).await,
        ServiceKind::Bash => bash::start(addr, ctx).await,
        ServiceKind::Http => http_proxy::start(addr, ctx).await,
        ServiceKind::Tftp => tftp::start(addr, ctx).await,
        ServiceKind::Elasticsearch => elasticsearch::start(addr, ctx).await,
    }
}
