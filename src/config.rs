use crate::error::PortError;
use crate::gateway::GatewaySettings;
use crate::ports::PortManager;
use crate::procfile::{parse_concurrency, StartOptions, PROCFILE};
use crate::proxy::PoolConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "forerunner.toml";

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Foreground Procfile runner settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Port leasing range for pooled processes
    #[serde(default)]
    pub ports: PortsConfig,

    /// Scale-to-zero front door
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Directory containing the Procfile (default: ".")
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Procfile name; a path here overrides `dir` with its parent
    #[serde(default = "default_procfile")]
    pub procfile: String,

    /// First port of the first group (default: 4000)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// `name=count,...` spec; every group gets one instance when unset
    pub concurrency: Option<String>,

    /// KEY=VALUE files merged into every launch (default: [".env"])
    #[serde(default = "default_env_files")]
    pub env_files: Vec<PathBuf>,

    /// Time between SIGTERM and SIGKILL on shutdown (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            procfile: default_procfile(),
            base_port: default_base_port(),
            concurrency: None,
            env_files: default_env_files(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl SupervisorConfig {
    /// Directory and file name of the Procfile
    pub fn procfile_location(&self) -> (PathBuf, String) {
        procfile_location(&self.dir, &self.procfile)
    }

    pub fn start_options(&self) -> StartOptions {
        let (dir, procfile) = self.procfile_location();
        StartOptions {
            dir,
            procfile,
            base_port: self.base_port,
            concurrency: self.concurrency.clone(),
            env_files: self.env_files.clone(),
            grace_period: Duration::from_secs(self.shutdown_grace_period_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// Lowest port handed out (default: 40000)
    #[serde(default = "default_min_port")]
    pub min: u16,

    /// Highest port handed out (default: 50000)
    #[serde(default = "default_max_port")]
    pub max: u16,

    /// Give up leasing after this many candidates; retries forever when unset
    pub max_lease_attempts: Option<u64>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: default_min_port(),
            max: default_max_port(),
            max_lease_attempts: None,
        }
    }
}

impl PortsConfig {
    pub fn port_manager(&self) -> Result<PortManager, PortError> {
        let ports = PortManager::new(self.min, self.max)?;
        Ok(match self.max_lease_attempts {
            Some(attempts) => ports.with_max_attempts(attempts),
            None => ports,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Front door port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Directory of the worker pool's Procfile (default: ".")
    #[serde(default = "default_dir")]
    pub pool_dir: PathBuf,

    /// Procfile name inside `pool_dir`
    #[serde(default = "default_procfile")]
    pub procfile: String,

    /// Group that serves HTTP traffic (default: "web")
    #[serde(default = "default_group")]
    pub group: String,

    /// Instances of `group` per active period (default: 2)
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Seconds without a request before the pool is stopped (default: 10)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Readiness polling interval in milliseconds (default: 200)
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Give up on a starting backend after this many seconds; waits forever when unset
    pub ready_timeout_secs: Option<u64>,

    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Requests that may wait for the coordinator (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_dir: default_dir(),
            procfile: default_procfile(),
            group: default_group(),
            instances: default_instances(),
            idle_timeout_secs: default_idle_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_timeout_secs: None,
            request_timeout_secs: default_request_timeout(),
            queue_capacity: default_queue_capacity(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.bind, self.port, e))
    }

    pub fn procfile_location(&self) -> (PathBuf, String) {
        procfile_location(&self.pool_dir, &self.procfile)
    }

    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ready_poll_interval: Duration::from_millis(self.ready_poll_interval_ms),
            ready_timeout: self.ready_timeout_secs.map(Duration::from_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            queue_capacity: self.queue_capacity,
            pool: PoolConfig {
                max_idle_per_host: self.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            },
        }
    }
}

/// Split a Procfile setting into directory and file name.
///
/// A bare name stays in `dir`; anything with a directory component replaces it.
fn procfile_location(dir: &Path, procfile: &str) -> (PathBuf, String) {
    let path = Path::new(procfile);
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            (parent.to_path_buf(), name.to_string_lossy().into_owned())
        }
        _ => (dir.to_path_buf(), procfile.to_string()),
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_procfile() -> String {
    PROCFILE.to_string()
}

fn default_base_port() -> u16 {
    4000
}

fn default_env_files() -> Vec<PathBuf> {
    vec![PathBuf::from(".env")]
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_min_port() -> u16 {
    40000
}

fn default_max_port() -> u16 {
    50000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_group() -> String {
    "web".to_string()
}

fn default_instances() -> usize {
    2
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_ready_poll_interval() -> u64 {
    200
}

fn default_request_timeout() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Some(spec) = &self.supervisor.concurrency {
            if let Err(e) = parse_concurrency(spec) {
                errors.push(format!("supervisor.concurrency: {}", e));
            }
        }
        if self.supervisor.procfile.trim().is_empty() {
            errors.push("supervisor.procfile must not be empty".to_string());
        }

        if let Err(e) = PortManager::new(self.ports.min, self.ports.max) {
            errors.push(format!("ports: {}", e));
        }
        if self.ports.max_lease_attempts == Some(0) {
            errors.push("ports.max_lease_attempts must be at least 1".to_string());
        }

        if self.gateway.group.trim().is_empty() {
            errors.push("gateway.group must not be empty".to_string());
        }
        if self.gateway.instances == 0 {
            errors.push("gateway.instances must be at least 1".to_string());
        }
        if self.gateway.idle_timeout_secs == 0 {
            errors.push("gateway.idle_timeout_secs must be at least 1".to_string());
        }
        if self.gateway.ready_poll_interval_ms == 0 {
            errors.push("gateway.ready_poll_interval_ms must be at least 1".to_string());
        }
        if self.gateway.queue_capacity == 0 {
            errors.push("gateway.queue_capacity must be at least 1".to_string());
        }
        if let Err(e) = self.gateway.bind_addr() {
            errors.push(format!("gateway: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
