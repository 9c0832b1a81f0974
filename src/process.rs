use crate::env::{expand, merged_environment, process_environment};
use crate::error::LaunchError;
use crate::ports::PortManager;
use crate::prefix::{pump, stderr_prefix, stdout_prefix, PrefixedLineWriter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for buffered output once a process has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One supervised OS process
pub struct ProcessInstance {
    name: String,
    index: usize,
    port: u16,
    env: BTreeMap<String, String>,
    child: Child,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    output: Vec<JoinHandle<()>>,
}

impl ProcessInstance {
    /// Display name, `{group}.{index}`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The environment the process was started with
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `:port`, ready to be joined with a host
    pub fn address(&self) -> String {
        format!(":{}", self.port)
    }

    /// Exit status if the process has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Check without blocking whether the process has exited
    pub fn has_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(instance = %self.name, error = %e, "Failed to poll process");
                false
            }
        }
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        info!(instance = %self.name, pid = ?self.pid, %status, "Process exited");
        self.drain_output().await;
        Ok(status)
    }

    /// Let the output pumps reach EOF.
    ///
    /// A pump stays open while a grandchild holds the pipe, so this gives up
    /// after a short while and leaves the task running detached.
    async fn drain_output(&mut self) {
        for task in self.output.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                debug!(instance = %self.name, "Output still open after exit");
            }
        }
    }

    /// SIGTERM, then SIGKILL once `grace_period` has passed
    async fn terminate(&mut self, grace_period: Duration) {
        if self.has_exited() {
            return;
        }

        if let Some(pid) = self.child.id() {
            debug!(instance = %self.name, pid, "Sending SIGTERM");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                info!(instance = %self.name, %status, "Process terminated");
            }
            Ok(Err(e)) => {
                warn!(instance = %self.name, error = %e, "Error waiting for process to exit");
            }
            Err(_) => {
                warn!(
                    instance = %self.name,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
                if let Ok(Some(status)) = self.child.try_wait() {
                    self.exit_status = Some(status);
                }
            }
        }
        self.drain_output().await;
    }
}

/// A named command template and the instances launched from it
pub struct ProcessGroup {
    name: String,
    command: String,
    dir: PathBuf,
    base_port: u16,
    ordinal: usize,
    ports: Option<Arc<PortManager>>,
    grace_period: Duration,
    instances: BTreeMap<usize, ProcessInstance>,
}

impl ProcessGroup {
    pub fn new(name: &str, command: &str, dir: impl Into<PathBuf>, base_port: u16) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            dir: dir.into(),
            base_port,
            ordinal: 0,
            ports: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            instances: BTreeMap::new(),
        }
    }

    /// Lease instance ports from `ports` instead of counting up from the base port
    pub fn with_port_manager(mut self, ports: Arc<PortManager>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub(crate) fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Position of the group's definition in its Procfile
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Number of tracked instances, exited ones included
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = &ProcessInstance> {
        self.instances.values()
    }

    pub fn instance(&self, index: usize) -> Option<&ProcessInstance> {
        self.instances.get(&index)
    }

    /// Number of tracked instances that have not exited yet
    pub fn running_count(&mut self) -> usize {
        self.instances
            .values_mut()
            .map(ProcessInstance::has_exited)
            .filter(|exited| !exited)
            .count()
    }

    /// Start one more instance.
    ///
    /// Returns as soon as the process is spawned; whether it is serving yet is
    /// up to the caller to find out.
    pub async fn launch(&mut self, extra_env: &[(String, String)]) -> Result<&ProcessInstance, LaunchError> {
        let index = self.instances.len();
        let name = format!("{}.{}", self.name, index);

        let port = match &self.ports {
            Some(ports) => ports.lease().await.map_err(|source| LaunchError::Lease {
                name: name.clone(),
                source,
            })?,
            None => u16::try_from(index)
                .ok()
                .and_then(|offset| self.base_port.checked_add(offset))
                .ok_or_else(|| LaunchError::PortOverflow {
                    name: name.clone(),
                    base: self.base_port,
                    index,
                })?,
        };

        let env = merged_environment(process_environment(), extra_env, port);
        let expanded = expand(&self.command, &env);
        let mut words = expanded.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| LaunchError::EmptyCommand { name: name.clone() })?
            .to_string();

        let mut cmd = Command::new(&program);
        cmd.args(words)
            .current_dir(&self.dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            name: name.clone(),
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        info!(group = %self.name, instance = %name, ?pid, port, command = %expanded, "Process launched");

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let writer = PrefixedLineWriter::new(std::io::stdout(), stdout_prefix(&name));
            output.push(tokio::spawn(async move {
                let _ = pump(stdout, writer).await;
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let writer = PrefixedLineWriter::new(std::io::stderr(), stderr_prefix(&name));
            output.push(tokio::spawn(async move {
                let _ = pump(stderr, writer).await;
            }));
        }

        let instance = ProcessInstance {
            name,
            index,
            port,
            env,
            child,
            pid,
            exit_status: None,
            output,
        };
        self.instances.insert(index, instance);
        Ok(&self.instances[&index])
    }

    /// Terminate every tracked instance and forget them
    pub async fn kill(&mut self) {
        if self.instances.is_empty() {
            return;
        }

        let grace_period = self.grace_period;
        let instances = std::mem::take(&mut self.instances);
        let count = instances.len();

        futures::future::join_all(instances.into_values().map(|mut instance| async move {
            instance.terminate(grace_period).await;
        }))
        .await;

        info!(group = %self.name, count, "Group killed");
    }

    /// `:port` of every tracked instance
    pub fn addrs(&self) -> Vec<String> {
        self.instances.values().map(ProcessInstance::address).collect()
    }

    /// Block until every tracked process has exited.
    ///
    /// Exited instances stay tracked until [`kill`](Self::kill).
    pub async fn wait(&mut self) {
        for instance in self.instances.values_mut() {
            if let Err(e) = instance.wait().await {
                warn!(instance = %instance.name, error = %e, "Failed to wait for process");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn group(command: &str, base_port: u16) -> (ProcessGroup, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let group = ProcessGroup::new("web", command, dir.path(), base_port)
            .with_grace_period(Duration::from_secs(2));
        (group, dir)
    }

    #[tokio::test]
    async fn test_launch_assigns_sequential_ports() {
        let (mut group, _dir) = group("sleep 30", 4000);

        let first = group.launch(&[]).await.unwrap();
        assert_eq!(first.name(), "web.0");
        assert_eq!(first.index(), 0);
        assert_eq!(first.port(), 4000);
        assert_eq!(first.env()["PORT"], "4000");
        assert!(first.pid().is_some());

        let second = group.launch(&[]).await.unwrap();
        assert_eq!(second.name(), "web.1");
        assert_eq!(second.port(), 4001);

        let mut addrs = group.addrs();
        addrs.sort();
        assert_eq!(addrs, vec![":4000".to_string(), ":4001".to_string()]);

        group.kill().await;
        assert!(group.is_empty());
        assert!(group.addrs().is_empty());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (mut group, _dir) = group("sleep 30", 4100);
        group.kill().await;

        group.launch(&[]).await.unwrap();
        group.kill().await;
        group.kill().await;
        assert_eq!(group.len(), 0);
    }

    #[tokio::test]
    async fn test_index_restarts_after_kill() {
        let (mut group, _dir) = group("sleep 30", 4200);
        group.launch(&[]).await.unwrap();
        group.launch(&[]).await.unwrap();
        group.kill().await;

        let again = group.launch(&[]).await.unwrap();
        assert_eq!(again.name(), "web.0");
        assert_eq!(again.port(), 4200);
        group.kill().await;
    }

    #[tokio::test]
    async fn test_extra_env_overrides_process_env() {
        std::env::set_var("FORERUNNER_TEST_MERGE", "1");
        let (mut group, _dir) = group("sleep 30", 4300);

        let extra = vec![("FORERUNNER_TEST_MERGE".to_string(), "2".to_string())];
        let instance = group.launch(&extra).await.unwrap();
        assert_eq!(instance.env()["FORERUNNER_TEST_MERGE"], "2");
        group.kill().await;
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let (mut group, _dir) = group("${FORERUNNER_TEST_UNSET_VAR}", 4400);
        let err = group.launch(&[]).await.err().unwrap();
        assert!(matches!(err, LaunchError::EmptyCommand { ref name } if name == "web.0"));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable_is_an_error() {
        let (mut group, _dir) = group("/nonexistent/forerunner-test-binary --flag", 4500);
        let err = group.launch(&[]).await.err().unwrap();
        match err {
            LaunchError::Spawn { name, program, .. } => {
                assert_eq!(name, "web.0");
                assert_eq!(program, "/nonexistent/forerunner-test-binary");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_command_placeholders_and_working_dir() {
        let (mut group, dir) = group("touch marker-${PORT}", 4600);
        group.launch(&[]).await.unwrap();
        group.wait().await;

        assert!(dir.path().join("marker-4600").exists());
    }

    #[tokio::test]
    async fn test_wait_keeps_exited_instances() {
        let (mut group, _dir) = group("true", 4700);
        group.launch(&[]).await.unwrap();
        group.launch(&[]).await.unwrap();
        group.wait().await;

        assert_eq!(group.len(), 2);
        assert_eq!(group.running_count(), 0);
        assert!(group.instance(0).unwrap().exit_status().unwrap().success());

        // exited instances still hold their index
        let third = group.launch(&[]).await.unwrap();
        assert_eq!(third.name(), "web.2");
        group.kill().await;
    }

    #[tokio::test]
    async fn test_kill_stops_running_processes() {
        let (mut group, _dir) = group("sleep 60", 4800);
        group.launch(&[]).await.unwrap();
        group.launch(&[]).await.unwrap();
        assert_eq!(group.running_count(), 2);

        let started = std::time::Instant::now();
        group.kill().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(group.running_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_with_port_manager() {
        let ports = Arc::new(PortManager::new(41000, 41999).unwrap());
        let (group, _dir) = group("sleep 30", 4900);
        let mut group = group.with_port_manager(ports);

        let first = group.launch(&[]).await.unwrap().port();
        let second = group.launch(&[]).await.unwrap().port();
        assert!((41000..=41999).contains(&first));
        assert!((41000..=41999).contains(&second));
        assert_ne!(first, second);
        assert_eq!(group.instance(1).unwrap().env()["PORT"], second.to_string());
        group.kill().await;
    }

    #[tokio::test]
    async fn test_port_overflow() {
        let (mut group, _dir) = group("sleep 30", u16::MAX);
        group.launch(&[]).await.unwrap();
        let err = group.launch(&[]).await.err().unwrap();
        assert!(matches!(err, LaunchError::PortOverflow { index: 1, .. }));
        group.kill().await;
    }
}
