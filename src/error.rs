use std::fmt;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::SubscriberId;

/// Main error type for the fleet sync engine
#[derive(Debug)]
pub enum FleetError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Control-plane RPC against a node failed
    Node(NodeError),

    /// Persistence errors
    Store(StoreError),

    /// Requested node or subscriber does not exist
    NotFound(String),

    /// API/HTTP related errors
    Api(String),

    /// The engine is shutting down or a background task went away
    Shutdown(String),
}

/// A node entry the proxy engine refused, e.g. failed parameter validation
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RejectedEntry {
    pub subscriber: SubscriberId,
    pub reason: String,
}

/// Outcome of a failed control-plane call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeError {
    /// Connection failed or the node answered with something unusable
    Unreachable(String),

    /// No answer within the per-call timeout
    Timeout(Duration),

    /// Permanent, per-entry failure. Never retried automatically.
    Rejected(Vec<RejectedEntry>),

    /// Node runs a configuration revision we did not expect
    VersionMismatch { expected: Option<u64>, actual: u64 },
}

/// Persistence related errors
#[derive(Debug)]
pub enum StoreError {
    /// Compare-and-set failed: the record changed since it was read
    Conflict(String),

    /// Record not present
    NotFound(String),

    /// The store cannot be reached
    Unavailable(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Snapshot encoding errors
    Serialization(serde_json::Error),
}

impl NodeError {
    /// Failures worth an early retry. Timeouts are handled exactly like
    /// unreachable nodes.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Unreachable(_) | NodeError::Timeout(_))
    }
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FleetError::Node(err) => write!(f, "Node error: {}", err),
            FleetError::Store(err) => write!(f, "Store error: {}", err),
            FleetError::NotFound(msg) => write!(f, "Not found: {}", msg),
            FleetError::Api(msg) => write!(f, "API error: {}", msg),
            FleetError::Shutdown(msg) => write!(f, "Shutting down: {}", msg),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Unreachable(msg) => write!(f, "unreachable: {}", msg),
            NodeError::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            NodeError::Rejected(entries) => {
                let ids: Vec<&str> = entries.iter().map(|e| e.subscriber.as_str()).collect();
                write!(f, "rejected {} entries: {}", entries.len(), ids.join(", "))
            }
            NodeError::VersionMismatch { expected, actual } => match expected {
                Some(expected) => write!(
                    f,
                    "version mismatch: expected revision {}, node reports {}",
                    expected, actual
                ),
                None => write!(f, "version mismatch: node reports revision {}", actual),
            },
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict(what) => write!(f, "Conflicting write: {}", what),
            StoreError::NotFound(what) => write!(f, "Missing record: {}", what),
            StoreError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            StoreError::Io(err) => write!(f, "I/O: {}", err),
            StoreError::Serialization(err) => write!(f, "JSON: {}", err),
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FleetError::Node(err) => Some(err),
            FleetError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for NodeError {}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            StoreError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, FleetError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// Axum IntoResponse implementation for HTTP error responses
impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl FleetError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            FleetError::Config(_) => StatusCode::BAD_REQUEST,
            FleetError::Node(_) => StatusCode::BAD_GATEWAY,
            FleetError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            FleetError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            FleetError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Api(_) => StatusCode::BAD_REQUEST,
            FleetError::Shutdown(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "configuration_error",
            FleetError::Node(_) => "node_error",
            FleetError::Store(StoreError::Conflict(_)) => "persistence_conflict",
            FleetError::Store(_) => "store_error",
            FleetError::NotFound(_) => "not_found",
            FleetError::Api(_) => "api_error",
            FleetError::Shutdown(_) => "shutting_down",
        }
    }
}

// Conversions from common error types
impl From<NodeError> for FleetError {
    fn from(err: NodeError) -> Self {
        FleetError::Node(err)
    }
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        FleetError::Store(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::FleetError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FleetError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! not_found {
    ($msg:expr) => {
        $crate::error::FleetError::NotFound($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FleetError::NotFound(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! api_error {
    ($msg:expr) => {
        $crate::error::FleetError::Api($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FleetError::Api(format!($fmt, $($arg)*))
    };
}
