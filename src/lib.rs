//! Forerunner - a Procfile supervisor with a scale-to-zero HTTP front door
//!
//! This library provides:
//! - Procfile parsing and process groups with per-instance `PORT` assignment
//! - Round-robin leasing of locally bindable ports
//! - Line-prefixed, colored output for every supervised process
//! - An admission gateway that starts a worker pool on the first request,
//!   load balances across it, and stops it again once traffic goes idle

pub mod balancer;
pub mod config;
pub mod env;
pub mod error;
pub mod gateway;
pub mod ports;
pub mod prefix;
pub mod process;
pub mod procfile;
pub mod proxy;

#[cfg(test)]
mod testutil;

pub use error::{GatewayError, LaunchError, ManifestError, PortError};
pub use gateway::{AdmissionGateway, FrontDoor, PoolLauncher, ProcfileLauncher};
pub use ports::PortManager;
pub use prefix::PrefixedLineWriter;
pub use process::{ProcessGroup, ProcessInstance};
pub use procfile::Manifest;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
