//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
    pub emulation: EmulationConfig,
    pub docker: DockerConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Central server address, `host:port` or a full URL
    pub addr: String,
    /// Agent name the server knows this node by
    pub agent_name: String,
    pub report_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9001".to_string(),
            agent_name: "default".to_string(),
            report_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    /// Delay before each accept, in milliseconds
    pub accept_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            accept_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    pub ssh_banner: String,
    /// Shell prompt shown by the SSH decoy
    pub ssh_hostname: String,
    /// The only credentials the SSH decoy accepts, and only in extended mode
    pub ssh_account: String,
    pub ssh_password: String,
    pub telnet_banner: String,
    pub telnet_prompt: String,
    pub ftp_banner: String,
    /// Command -> canned output. The `default` entry answers anything else.
    pub ssh_commands: HashMap<String, String>,
    pub telnet_commands: HashMap<String, String>,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            ssh_banner: "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5".to_string(),
            ssh_hostname: "root@ubuntu:~# ".to_string(),
            ssh_account: "root".to_string(),
            ssh_password: "123456".to_string(),
            telnet_banner: "\r\nUbuntu 20.04.6 LTS\r\n".to_string(),
            telnet_prompt: "root@ubuntu:~# ".to_string(),
            ftp_banner: "220 (vsFTPd 3.0.3)".to_string(),
            ssh_commands: default_shell_commands(),
            telnet_commands: default_shell_commands(),
        }
    }
}

fn default_shell_commands() -> HashMap<String, String> {
    [
        ("pwd", "/root"),
        ("whoami", "root"),
        ("id", "uid=0(root) gid=0(root) groups=0(root)"),
        ("uname", "Linux"),
        ("uname -a", "Linux ubuntu 5.4.0-150-generic #167-Ubuntu SMP x86_64 GNU/Linux"),
        ("ls", "snap"),
        ("hostname", "ubuntu"),
        ("default", "-bash: command not found"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Program spawned behind the exec-attach relay
    pub exec_shell: String,
    pub exec_args: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            exec_shell: "/bin/bash".to_string(),
            exec_args: vec!["-i".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// "0" off, "1" on, "2" on with extended mode
    #[serde(default)]
    pub status: String,
    /// Bind address; for the bash decoy this is the socket path
    #[serde(default)]
    pub addr: String,
}

impl ServiceConfig {
    fn new(status: &str, addr: &str) -> Self {
        Self {
            status: status.to_string(),
            addr: addr.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub ssh: ServiceConfig,
    pub telnet: ServiceConfig,
    pub ftp: ServiceConfig,
    pub redis: ServiceConfig,
    pub docker: ServiceConfig,
    pub kubelet: ServiceConfig,
    pub etcd: ServiceConfig,
    pub apiserver: ServiceConfig,
    pub bash: ServiceConfig,
    pub http: ServiceConfig,
    pub tftp: ServiceConfig,
    pub elasticsearch: ServiceConfig,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            ssh: ServiceConfig::new("1", "0.0.0.0:22"),
            telnet: ServiceConfig::new("1", "0.0.0.0:23"),
            ftp: ServiceConfig::new("1", "0.0.0.0:21"),
            redis: ServiceConfig::new("0", "0.0.0.0:6379"),
            docker: ServiceConfig::new("1", "0.0.0.0:2375"),
            kubelet: ServiceConfig::new("1", "0.0.0.0:10255"),
            etcd: ServiceConfig::new("1", "0.0.0.0:2379"),
            apiserver: ServiceConfig::new("1", "0.0.0.0:6443"),
            bash: ServiceConfig::new("1", "/tmp/c_keepalive.sock"),
            http: ServiceConfig::new("1", "0.0.0.0:8081"),
            tftp: ServiceConfig::new("1", "0.0.0.0:69"),
            elasticsearch: ServiceConfig::new("1", "0.0.0.0:9200"),
        }
    }
}

impl ServicesConfig {
    /// Settings for a service by name, with empty fields filled from the defaults
    pub fn get(&self, name: &str) -> Option<ServiceConfig> {
        let defaults = ServicesConfig::default();
        let (set, fallback) = match name {
            "ssh" => (&self.ssh, defaults.ssh),
            "telnet" => (&self.telnet, defaults.telnet),
            "ftp" => (&self.ftp, defaults.ftp),
            "redis" => (&self.redis, defaults.redis),
            "docker" => (&self.docker, defaults.docker),
            "kubelet" => (&self.kubelet, defaults.kubelet),
            "etcd" => (&self.etcd, defaults.etcd),
            "apiserver" => (&self.apiserver, defaults.apiserver),
            "bash" => (&self.bash, defaults.bash),
            "http" => (&self.http, defaults.http),
            "tftp" => (&self.tftp, defaults.tftp),
            "elasticsearch" => (&self.elasticsearch, defaults.elasticsearch),
            _ => return None,
        };

        Some(ServiceConfig {
            status: if set.status.is_empty() { fallback.status } else { set.status.clone() },
            addr: if set.addr.is_empty() { fallback.addr } else { set.addr.clone() },
        })
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AGENT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("AGENT").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            anyhow::bail!("Server address cannot be empty");
        }
        if self.server.report_timeout_secs == 0 {
            anyhow::bail!("Invalid report_timeout_secs: 0 is not allowed");
        }
        if self.control.interval_secs == 0 {
            anyhow::bail!("Invalid control interval: 0 is not allowed");
        }
        if self.pool.capacity == 0 {
            anyhow::bail!("Invalid pool capacity: 0 is not allowed");
        }
        if !self.emulation.ssh_banner.starts_with("SSH-2.0-") {
            anyhow::bail!("Invalid ssh_banner '{}': must start with SSH-2.0-", self.emulation.ssh_banner);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    /// Server base URL with a scheme
    pub fn server_url(&self) -> String {
        crate::client::normalize_base_url(&self.server.addr)
    }
}
