//! Per-backend HTTP forwarding
//!
//! A [`BackendProxy`] sends requests to one backend address through a shared
//! pooled client, so that connections are reused across requests.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::ports::dial_address;
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Body type used on both sides of the front door
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Default time a backend has to answer a forwarded request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can answer an HTTP request.
///
/// Failures are reported as error responses, never as `Err`.
pub trait Forward: Send + Sync {
    fn forward(&self, req: Request<Body>) -> BoxFuture<'_, Response<Body>>;
}

/// Configuration for the pooled backend client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP client shared by every backend proxy
pub type BackendClient = Client<HttpConnector, Body>;

/// Build the pooled client used to reach backends
pub fn backend_client(config: &PoolConfig) -> BackendClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.enforce_http(true);

    debug!(
        max_idle = config.max_idle_per_host,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Backend client initialized"
    );

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .build(connector)
}

/// Reverse proxy for a single backend address
pub struct BackendProxy {
    /// Address as reported by the process group, e.g. `:4000`
    addr: String,
    /// `host:port` actually dialled
    authority: String,
    client: BackendClient,
    request_timeout: Duration,
    requests: AtomicU64,
}

impl BackendProxy {
    pub fn new(addr: &str, client: BackendClient) -> Self {
        Self {
            addr: addr.to_string(),
            authority: dial_address(addr),
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            requests: AtomicU64::new(0),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of requests forwarded so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Rewrite `req` to target this backend, keeping method, path, query and headers
    fn backend_request(&self, req: Request<Body>) -> Result<Request<Body>, String> {
        let uri = format!(
            "http://{}{}",
            self.authority,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        builder.body(body).map_err(|e| e.to_string())
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        let backend_req = match self.backend_request(req) {
            Ok(r) => r,
            Err(e) => {
                error!(backend = %self.addr, error = %e, "Failed to build backend request");
                return json_error_response(ProxyErrorCode::InternalError, "Invalid request");
            }
        };

        self.requests.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.request_timeout, self.client.request(backend_req)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                error!(backend = %self.addr, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    backend = %self.addr,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        }
    }
}

impl Forward for BackendProxy {
    fn forward(&self, req: Request<Body>) -> BoxFuture<'_, Response<Body>> {
        Box::pin(self.send(req))
    }
}
