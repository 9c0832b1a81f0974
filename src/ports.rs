//! Port leasing and backend reachability checks
//!
//! [`PortManager`] hands out ports from an inclusive range in round-robin
//! order, skipping any port that cannot be bound locally at the moment it is
//! considered. Leases are best-effort: nothing stops an unrelated process from
//! grabbing a port between the lease and the child binding it.

use crate::error::{GatewayError, PortError};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Pause after a full sweep of the range found nothing free
const SWEEP_BACKOFF_MS: u64 = 50;

/// Hands out locally bindable ports from `[min, max]`.
///
/// The cursor is the only shared state; it is advanced under a lock so that
/// concurrent callers never consider the same candidate at the same time.
/// The bind check itself runs outside the lock.
#[derive(Debug)]
pub struct PortManager {
    min: u16,
    max: u16,
    cursor: Mutex<u16>,
    max_attempts: Option<u64>,
}

impl PortManager {
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min == 0 || min > max {
            return Err(PortError::InvalidRange { min, max });
        }
        Ok(Self {
            min,
            max,
            cursor: Mutex::new(min),
            max_attempts: None,
        })
    }

    /// Give up after `attempts` candidates instead of retrying forever
    pub fn with_max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn min_port(&self) -> u16 {
        self.min
    }

    pub fn max_port(&self) -> u16 {
        self.max
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> u64 {
        u64::from(self.max - self.min) + 1
    }

    fn next_candidate(&self) -> u16 {
        let mut cursor = self.cursor.lock();
        let port = *cursor;
        *cursor = if port >= self.max { self.min } else { port + 1 };
        port
    }

    /// Lease the next port that can currently be bound.
    ///
    /// Without a configured attempt ceiling this waits until a port frees up.
    pub async fn lease(&self) -> Result<u16, PortError> {
        let sweep = self.capacity();
        let mut attempts: u64 = 0;

        loop {
            let port = self.next_candidate();
            attempts += 1;

            if port_available(port).await {
                debug!(port, attempts, "Leased port");
                return Ok(port);
            }
            debug!(port, "Port unavailable, trying next");

            if let Some(limit) = self.max_attempts {
                if attempts >= limit {
                    return Err(PortError::Exhausted {
                        min: self.min,
                        max: self.max,
                        attempts,
                    });
                }
            }

            if attempts % sweep == 0 {
                tokio::time::sleep(Duration::from_millis(SWEEP_BACKOFF_MS)).await;
            }
        }
    }
}

/// Check whether `port` can be bound on all interfaces right now
pub async fn port_available(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            debug!(port, error = %e, "Bind check failed");
            false
        }
    }
}

/// Turn a `:port` address suffix into something connectable
pub fn dial_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    }
}

/// Poll-connect to `addr` every `interval` until it accepts a connection.
///
/// With `timeout` set to `None` this never gives up.
pub async fn wait_reachable(
    addr: &str,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<(), GatewayError> {
    let target = dial_address(addr);
    let start = Instant::now();

    loop {
        match TcpStream::connect(&target).await {
            Ok(stream) => {
                drop(stream);
                debug!(addr = %target, waited_ms = start.elapsed().as_millis(), "Backend reachable");
                return Ok(());
            }
            Err(e) => {
                if let Some(limit) = timeout {
                    if start.elapsed() >= limit {
                        return Err(GatewayError::NotReachable {
                            addr: target,
                            waited: start.elapsed(),
                        });
                    }
                }
                debug!(addr = %target, error = %e, "Backend not reachable yet");
            }
        }
        tokio::time::sleep(interval).await;
    }
}
