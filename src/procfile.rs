//! Procfile manifests
//!
//! A Procfile declares one process group per line:
//!
//! ```text
//! web: ./server --port ${PORT}
//! worker: ./worker
//! ```
//!
//! Groups are numbered in file order and each gets a block of 100 ports
//! starting at `base_port + 100 * ordinal`.

use crate::env::load_env_file;
use crate::error::{LaunchError, ManifestError};
use crate::ports::PortManager;
use crate::process::{ProcessGroup, ProcessInstance, DEFAULT_GRACE_PERIOD};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default manifest file name
pub const PROCFILE: &str = "Procfile";

/// Ports reserved per group when no port manager is used
pub const PORT_BLOCK: u16 = 100;

/// A parsed Procfile and the process groups it declares
pub struct Manifest {
    dir: PathBuf,
    file_name: String,
    base_port: u16,
    ports: Option<Arc<PortManager>>,
    grace_period: Duration,
    extra_env: Vec<(String, String)>,
    groups: HashMap<String, ProcessGroup>,
    concurrency: HashMap<String, usize>,
}

impl Manifest {
    pub fn new(dir: impl Into<PathBuf>, base_port: u16) -> Self {
        Self {
            dir: dir.into(),
            file_name: PROCFILE.to_string(),
            base_port,
            ports: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            extra_env: Vec::new(),
            groups: HashMap::new(),
            concurrency: HashMap::new(),
        }
    }

    /// Read `file_name` instead of `Procfile`
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Lease instance ports from a shared port manager
    pub fn with_port_manager(mut self, ports: Arc<PortManager>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Extra variables passed to every launched process
    pub fn with_extra_env(mut self, extra_env: Vec<(String, String)>) -> Self {
        self.extra_env = extra_env;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, name: &str) -> Option<&ProcessGroup> {
        self.groups.get(name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut ProcessGroup> {
        self.groups.get_mut(name)
    }

    /// Group names in Procfile order
    pub fn group_names(&self) -> Vec<&str> {
        let mut groups: Vec<&ProcessGroup> = self.groups.values().collect();
        groups.sort_by_key(|group| group.ordinal());
        groups.into_iter().map(ProcessGroup::name).collect()
    }

    /// Desired instance count per group, empty when unset
    pub fn concurrency(&self) -> &HashMap<String, usize> {
        &self.concurrency
    }

    /// Read the Procfile from disk and build its process groups
    pub fn parse(&mut self) -> Result<(), ManifestError> {
        let path = self.path();
        let contents = std::fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        self.parse_str(&contents)?;
        info!(path = %path.display(), groups = self.groups.len(), "Procfile parsed");
        Ok(())
    }

    /// Build process groups from Procfile text.
    ///
    /// Replaces any groups parsed before. A repeated name overwrites the
    /// earlier definition.
    pub fn parse_str(&mut self, contents: &str) -> Result<(), ManifestError> {
        let mut groups = HashMap::new();
        let mut ordinal = 0usize;

        for (line_no, line) in contents.lines().enumerate().map(|(i, l)| (i + 1, l)) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (name, command) = trimmed.split_once(':').ok_or_else(|| ManifestError::MissingColon {
                line_no,
                line: trimmed.to_string(),
            })?;
            let name = name.trim();
            let command = command.trim();
            if name.is_empty() {
                return Err(ManifestError::EmptyName { line_no });
            }

            let base_port = u16::try_from(ordinal)
                .ok()
                .and_then(|n| n.checked_mul(PORT_BLOCK))
                .and_then(|offset| self.base_port.checked_add(offset))
                .ok_or_else(|| ManifestError::PortOutOfRange {
                    name: name.to_string(),
                    base: self.base_port,
                    ordinal,
                })?;

            let mut group = ProcessGroup::new(name, command, self.dir.clone(), base_port)
                .with_grace_period(self.grace_period)
                .with_ordinal(ordinal);
            if let Some(ports) = &self.ports {
                group = group.with_port_manager(Arc::clone(ports));
            }

            if groups.insert(name.to_string(), group).is_some() {
                warn!(group = name, line_no, "Duplicate process name, later definition wins");
            }
            debug!(group = name, base_port, command, "Process group defined");
            ordinal += 1;
        }

        self.groups = groups;
        Ok(())
    }

    /// Parse a `name=count,name=count` spec.
    ///
    /// Names that match no group are accepted and ignored at launch.
    pub fn set_concurrency(&mut self, spec: &str) -> Result<(), ManifestError> {
        self.concurrency = parse_concurrency(spec)?;
        Ok(())
    }

    /// Launch the configured number of instances.
    ///
    /// Without a concurrency spec every group gets one instance. With one,
    /// only the groups it names are launched. Returns how many processes
    /// were started; stops at the first launch error.
    pub async fn launch_all(&mut self) -> Result<usize, LaunchError> {
        let mut groups: Vec<&mut ProcessGroup> = self.groups.values_mut().collect();
        groups.sort_by_key(|group| group.ordinal());

        let mut launched = 0;
        for group in groups {
            let count = if self.concurrency.is_empty() {
                1
            } else {
                self.concurrency.get(group.name()).copied().unwrap_or(0)
            };
            for _ in 0..count {
                group.launch(&self.extra_env).await?;
                launched += 1;
            }
        }
        Ok(launched)
    }

    /// Launch one more instance of `name`; `Ok(None)` if there is no such group
    pub async fn launch(&mut self, name: &str) -> Result<Option<&ProcessInstance>, LaunchError> {
        match self.groups.get_mut(name) {
            Some(group) => group.launch(&self.extra_env).await.map(Some),
            None => Ok(None),
        }
    }

    /// Wait for every process in every group to exit
    pub async fn wait(&mut self) {
        for group in self.groups.values_mut() {
            group.wait().await;
        }
    }

    /// Kill every process in every group
    pub async fn kill(&mut self) {
        futures::future::join_all(self.groups.values_mut().map(|group| group.kill())).await;
    }

    /// Addresses of the instances in `name`, empty for an unknown group
    pub fn addrs_for(&self, name: &str) -> Vec<String> {
        self.groups
            .get(name)
            .map(ProcessGroup::addrs)
            .unwrap_or_default()
    }

    /// Processes across all groups that have not exited yet
    pub fn running_count(&mut self) -> usize {
        self.groups.values_mut().map(ProcessGroup::running_count).sum()
    }
}

/// Parse `name=count` pairs separated by commas
pub fn parse_concurrency(spec: &str) -> Result<HashMap<String, usize>, ManifestError> {
    let mut counts = HashMap::new();

    for pair in spec.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let (name, count) = pair
            .split_once('=')
            .ok_or_else(|| ManifestError::InvalidConcurrency {
                pair: pair.to_string(),
                reason: "expected name=count".to_string(),
            })?;
        let count = count
            .trim()
            .parse::<usize>()
            .map_err(|e| ManifestError::InvalidConcurrency {
                pair: pair.to_string(),
                reason: e.to_string(),
            })?;
        counts.insert(name.trim().to_string(), count);
    }

    Ok(counts)
}

/// Everything the foreground runner needs
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub dir: PathBuf,
    pub procfile: String,
    pub base_port: u16,
    pub concurrency: Option<String>,
    /// Relative paths are resolved against `dir`
    pub env_files: Vec<PathBuf>,
    pub grace_period: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            procfile: PROCFILE.to_string(),
            base_port: 4000,
            concurrency: None,
            env_files: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Load env files in order; missing files are skipped
pub fn load_env_files(dir: &Path, files: &[PathBuf]) -> Result<Vec<(String, String)>, ManifestError> {
    let mut vars = Vec::new();
    for file in files {
        let path = if file.is_absolute() { file.clone() } else { dir.join(file) };
        if !path.exists() {
            debug!(path = %path.display(), "Env file not found, skipping");
            continue;
        }
        let loaded = load_env_file(&path)?;
        debug!(path = %path.display(), vars = loaded.len(), "Env file loaded");
        vars.extend(loaded);
    }
    Ok(vars)
}

/// Run a Procfile in the foreground.
///
/// Launches every configured process and waits for all of them to exit, or
/// for `shutdown` to resolve, in which case everything is killed.
pub async fn start<S>(options: StartOptions, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let extra_env = load_env_files(&options.dir, &options.env_files)?;

    let mut manifest = Manifest::new(&options.dir, options.base_port)
        .with_file_name(options.procfile.clone())
        .with_grace_period(options.grace_period)
        .with_extra_env(extra_env);
    manifest.parse()?;

    if let Some(spec) = options.concurrency.as_deref().filter(|s| !s.trim().is_empty()) {
        manifest.set_concurrency(spec)?;
    }

    if let Err(e) = manifest.launch_all().await {
        manifest.kill().await;
        return Err(e.into());
    }
    info!(running = manifest.running_count(), "All processes launched");

    let interrupted = tokio::select! {
        _ = manifest.wait() => false,
        _ = shutdown => true,
    };

    if interrupted {
        info!("Shutdown requested, stopping processes");
        manifest.kill().await;
    } else {
        info!("All processes exited");
    }
    Ok(())
}
