//! Round-robin load balancing across backend proxies

use crate::error::{json_error_response, ProxyErrorCode};
use crate::proxy::{Body, Forward};
use futures::future::BoxFuture;
use hyper::{Request, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Spreads requests over a fixed set of backends in turn
pub struct Balancer {
    backends: Vec<Arc<dyn Forward>>,
    round_robin_index: AtomicUsize,
}

impl Balancer {
    pub fn new(backends: Vec<Arc<dyn Forward>>) -> Self {
        Self {
            backends,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Pick the next backend, `None` when there are none
    pub fn next_backend(&self) -> Option<&Arc<dyn Forward>> {
        if self.backends.is_empty() {
            return None;
        }
        let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        debug!(backend = idx, total_backends = self.backends.len(), "Selected backend");
        self.backends.get(idx)
    }
}

impl Forward for Balancer {
    fn forward(&self, req: Request<Body>) -> BoxFuture<'_, Response<Body>> {
        match self.next_backend() {
            Some(backend) => backend.forward(req),
            None => Box::pin(async {
                json_error_response(ProxyErrorCode::GatewayUnavailable, "No backends available")
            }),
        }
    }
}
