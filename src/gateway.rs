//! Scale-to-zero admission gateway
//!
//! A single coordinator task owns the worker pool. Front-door connections
//! never touch the pool directly: each request is queued to the coordinator
//! together with a oneshot sender, and the connection waits for the response
//! to come back on it.
//!
//! The coordinator is either idle (no pool) or active (pool running behind a
//! [`Balancer`]). The first request dequeued while idle launches the pool and
//! waits until every backend accepts connections before it is forwarded.
//! Requests that arrive meanwhile stay queued. Once no request has been
//! dequeued for the idle window the pool is killed and the coordinator goes
//! back to idle.

use crate::balancer::Balancer;
use crate::error::{json_error_response, GatewayError, ProxyErrorCode};
use crate::ports::{wait_reachable, PortManager};
use crate::procfile::Manifest;
use crate::proxy::{backend_client, Body, BackendClient, BackendProxy, Forward, PoolConfig};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Starts and stops the worker pool on behalf of the coordinator
pub trait PoolLauncher: Send + 'static {
    /// Name of the process group that serves traffic
    fn group(&self) -> &str;

    /// Bring the pool up and return the backend addresses
    fn launch(&mut self) -> BoxFuture<'_, Result<Vec<String>, GatewayError>>;

    /// Stop everything started by the last `launch`
    fn kill(&mut self) -> BoxFuture<'_, ()>;
}

/// Launches the pool from a Procfile, one fresh [`Manifest`] per active period
pub struct ProcfileLauncher {
    dir: PathBuf,
    procfile: String,
    base_port: u16,
    group: String,
    instances: usize,
    ports: Arc<PortManager>,
    grace_period: Duration,
    extra_env: Vec<(String, String)>,
    manifest: Option<Manifest>,
}

impl ProcfileLauncher {
    pub fn new(dir: impl Into<PathBuf>, group: &str, instances: usize, ports: Arc<PortManager>) -> Self {
        Self {
            dir: dir.into(),
            procfile: crate::procfile::PROCFILE.to_string(),
            base_port: 4000,
            group: group.to_string(),
            instances,
            ports,
            grace_period: crate::process::DEFAULT_GRACE_PERIOD,
            extra_env: Vec::new(),
            manifest: None,
        }
    }

    pub fn with_procfile(mut self, procfile: impl Into<String>) -> Self {
        self.procfile = procfile.into();
        self
    }

    /// Base port for the Procfile's group blocks; instance ports are leased
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_extra_env(mut self, extra_env: Vec<(String, String)>) -> Self {
        self.extra_env = extra_env;
        self
    }

    async fn start_pool(&mut self) -> Result<Vec<String>, GatewayError> {
        // a previous pool that was never killed would leak its processes
        self.stop_pool().await;

        let mut manifest = Manifest::new(&self.dir, self.base_port)
            .with_file_name(self.procfile.clone())
            .with_port_manager(Arc::clone(&self.ports))
            .with_grace_period(self.grace_period)
            .with_extra_env(self.extra_env.clone());
        manifest.parse()?;
        manifest.set_concurrency(&format!("{}={}", self.group, self.instances))?;

        let launched = manifest.launch_all().await;
        let addrs = manifest.addrs_for(&self.group);
        self.manifest = Some(manifest);
        launched?;

        Ok(addrs)
    }

    async fn stop_pool(&mut self) {
        if let Some(mut manifest) = self.manifest.take() {
            manifest.kill().await;
        }
    }
}

impl PoolLauncher for ProcfileLauncher {
    fn group(&self) -> &str {
        &self.group
    }

    fn launch(&mut self) -> BoxFuture<'_, Result<Vec<String>, GatewayError>> {
        Box::pin(self.start_pool())
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_pool())
    }
}

/// Tunables for the coordinator
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Kill the pool after this long without a request
    pub idle_timeout: Duration,
    /// How often to poll a starting backend
    pub ready_poll_interval: Duration,
    /// Give up on a starting backend after this long; `None` waits forever
    pub ready_timeout: Option<Duration>,
    /// Per-request timeout for forwarded requests
    pub request_timeout: Duration,
    /// Maximum number of requests waiting for the coordinator
    pub queue_capacity: usize,
    pub pool: PoolConfig,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            ready_poll_interval: Duration::from_millis(200),
            ready_timeout: None,
            request_timeout: Duration::from_secs(30),
            queue_capacity: 1024,
            pool: PoolConfig::default(),
        }
    }
}

/// Whether the worker pool is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Starting,
    Active,
    Stopped,
}

/// A request waiting for the coordinator
struct Admission {
    req: Request<Body>,
    respond: oneshot::Sender<Response<Body>>,
}

/// Handle used to submit requests to the coordinator.
///
/// Cheap to clone; every clone talks to the same coordinator.
#[derive(Clone)]
pub struct AdmissionGateway {
    tx: mpsc::Sender<Admission>,
    state_rx: watch::Receiver<PoolState>,
}

impl AdmissionGateway {
    /// Start the coordinator task
    pub fn spawn<L: PoolLauncher>(
        launcher: L,
        settings: GatewaySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(PoolState::Idle);

        let coordinator = Coordinator {
            client: backend_client(&settings.pool),
            launcher,
            settings,
            rx,
            state_tx,
        };
        let handle = tokio::spawn(coordinator.run(shutdown_rx));

        (Self { tx, state_rx }, handle)
    }

    pub fn state(&self) -> PoolState {
        *self.state_rx.borrow()
    }

    /// Queue `req` and wait for its response
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let (respond, response) = oneshot::channel();

        if self.tx.send(Admission { req, respond }).await.is_err() {
            return json_error_response(ProxyErrorCode::GatewayUnavailable, "Gateway is shutting down");
        }

        match response.await {
            Ok(response) => response,
            Err(_) => {
                warn!("Coordinator dropped a queued request");
                json_error_response(ProxyErrorCode::GatewayUnavailable, "Gateway is shutting down")
            }
        }
    }
}

impl Forward for AdmissionGateway {
    fn forward(&self, req: Request<Body>) -> BoxFuture<'_, Response<Body>> {
        Box::pin(self.handle(req))
    }
}

/// Sole owner of the pool
struct Coordinator<L> {
    launcher: L,
    settings: GatewaySettings,
    client: BackendClient,
    rx: mpsc::Receiver<Admission>,
    state_tx: watch::Sender<PoolState>,
}

impl<L: PoolLauncher> Coordinator<L> {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut active: Option<Arc<Balancer>> = None;
        let mut watching_shutdown = true;

        loop {
            let admission = tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(admission) => admission,
                    None => break,
                },
                _ = tokio::time::sleep(self.settings.idle_timeout), if active.is_some() => {
                    info!(
                        group = self.launcher.group(),
                        idle_secs = self.settings.idle_timeout.as_secs_f64(),
                        "Pool idle, stopping"
                    );
                    active = None;
                    self.launcher.kill().await;
                    self.set_state(PoolState::Idle);
                    continue;
                }
                changed = shutdown_rx.changed(), if watching_shutdown => {
                    match changed {
                        Ok(()) if *shutdown_rx.borrow() => break,
                        Ok(()) => {}
                        Err(_) => watching_shutdown = false,
                    }
                    continue;
                }
            };

            let balancer = match active.clone() {
                Some(balancer) => balancer,
                None => {
                    self.set_state(PoolState::Starting);
                    let started = tokio::select! {
                        result = self.activate() => Some(result),
                        _ = shutdown_signalled(&mut shutdown_rx) => None,
                    };

                    match started {
                        Some(Ok(balancer)) => {
                            active = Some(Arc::clone(&balancer));
                            self.set_state(PoolState::Active);
                            balancer
                        }
                        Some(Err(e)) => {
                            error!(group = self.launcher.group(), error = %e, "Failed to start pool");
                            self.launcher.kill().await;
                            self.set_state(PoolState::Idle);
                            let _ = admission.respond.send(json_error_response(
                                ProxyErrorCode::BackendStartFailed,
                                "Backend unavailable",
                            ));
                            continue;
                        }
                        None => {
                            let _ = admission.respond.send(json_error_response(
                                ProxyErrorCode::GatewayUnavailable,
                                "Gateway is shutting down",
                            ));
                            self.launcher.kill().await;
                            break;
                        }
                    }
                }
            };

            tokio::spawn(async move {
                let response = balancer.forward(admission.req).await;
                let _ = admission.respond.send(response);
            });
        }

        info!("Admission coordinator shutting down");
        if active.take().is_some() {
            self.launcher.kill().await;
        }
        self.rx.close();
        self.set_state(PoolState::Stopped);
    }

    /// Launch the pool and wait until every backend accepts connections
    async fn activate(&mut self) -> Result<Arc<Balancer>, GatewayError> {
        info!(group = self.launcher.group(), "Starting pool");
        let addrs = self.launcher.launch().await?;
        if addrs.is_empty() {
            return Err(GatewayError::NoAddresses {
                group: self.launcher.group().to_string(),
            });
        }

        for addr in &addrs {
            debug!(addr = %addr, "Waiting for backend");
            wait_reachable(addr, self.settings.ready_poll_interval, self.settings.ready_timeout).await?;
        }

        let backends: Vec<Arc<dyn Forward>> = addrs
            .iter()
            .map(|addr| {
                Arc::new(
                    BackendProxy::new(addr, self.client.clone())
                        .with_request_timeout(self.settings.request_timeout),
                ) as Arc<dyn Forward>
            })
            .collect();

        info!(group = self.launcher.group(), backends = backends.len(), ?addrs, "Pool active");
        Ok(Arc::new(Balancer::new(backends)))
    }

    fn set_state(&self, state: PoolState) {
        self.state_tx.send_replace(state);
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// HTTP listener that hands every request to the gateway
pub struct FrontDoor {
    bind_addr: SocketAddr,
    gateway: AdmissionGateway,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(bind_addr: SocketAddr, gateway: AdmissionGateway, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Front door listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = self.gateway.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, gateway: AdmissionGateway) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        async move { Ok::<_, hyper::Error>(handle_request(req, gateway, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(mut req: Request<Incoming>, gateway: AdmissionGateway, client_addr: SocketAddr) -> Response<Body> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // overwrite rather than append: this is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    gateway.handle(req.map(|body| body.boxed())).await
}
