//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Error codes surfaced to clients of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Pool is empty or every host was already attempted
    NoBackendAvailable,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Request body could not be read
    BadRequest,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
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
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors reported by a compute provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The resource already exists (expected for idempotent setup on restart)
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Request(err.to_string())
    }
}

/// Errors from a launch or terminate operation
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The poll loop did not observe the target state before its deadline
    #[error("instance {instance_id} did not reach {target} within {waited:?}")]
    Timeout {
        instance_id: String,
        target: &'static str,
        waited: Duration,
    },
    #[error("operation cancelled by shutdown")]
    Cancelled,
    /// The worker went away without reporting a result
    #[error("lifecycle worker dropped before completing")]
    WorkerLost,
}

/// Errors from a metrics source query
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Request(String),
    #[error("unexpected metrics response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for MetricsError {
    fn from(err: reqwest::Error) -> Self {
        MetricsError::Request(err.to_string())
    }
}

/// Errors from probing a member directly for its load
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The member could not be reached at all
    #[error("could not connect to {0}")]
    Connect(String),
    /// The member answered but the value was unusable
    #[error("invalid load reading from {address}: {reason}")]
    Invalid { address: String, reason: String },
}
