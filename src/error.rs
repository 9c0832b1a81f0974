//! Error types for the supervisor and JSON error responses for the front door

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading a Procfile or a concurrency spec
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line_no}: expected `name: command`, got {line:?}")]
    MissingColon { line_no: usize, line: String },

    #[error("line {line_no}: process name is empty")]
    EmptyName { line_no: usize },

    #[error("invalid concurrency pair {pair:?}: {reason}")]
    InvalidConcurrency { pair: String, reason: String },

    #[error("process {name:?}: base port {base} + 100 x {ordinal} is out of range")]
    PortOutOfRange { name: String, base: u16, ordinal: usize },
}

/// Errors raised by the port manager
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },

    #[error("no free port in {min}-{max} after {attempts} attempts")]
    Exhausted { min: u16, max: u16, attempts: u64 },
}

/// Errors raised when launching a process instance
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{name}: command expands to nothing")]
    EmptyCommand { name: String },

    #[error("{name}: failed to start `{program}`: {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name}: port {base} + {index} is out of range")]
    PortOverflow { name: String, base: u16, index: usize },

    #[error("{name}: {source}")]
    Lease {
        name: String,
        #[source]
        source: PortError,
    },
}

/// Errors raised while bringing the worker pool up
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("group {group:?} produced no backend addresses")]
    NoAddresses { group: String },

    #[error("backend {addr} not reachable after {:?}", waited)]
    NotReachable { addr: String, waited: Duration },

    #[error("admission coordinator is not running")]
    CoordinatorGone,
}

/// Error codes for front-door errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Worker pool failed to start
    BackendStartFailed,
    /// Request timed out waiting for a backend response
    RequestTimeout,
    /// Failed to connect to a backend
    ConnectionFailed,
    /// The admission coordinator has shut down
    GatewayUnavailable,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
