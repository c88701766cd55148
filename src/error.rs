//! Error types for the shardkeeper reconciliation engine.
//!
//! This module provides a unified error type [`Error`] for every layer of the
//! engine, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Platform**: Kubernetes API failures (not-found, conflict, invalid update)
//! - **Node**: failures talking to an individual store member, either over the
//!   wire protocol or through a remote exec channel
//! - **Topology**: a cluster declared broken after repair attempts, or a
//!   topology change paused by unhealthy nodes
//! - **Workload**: aggregated claim resize failures and rejected updates
//!
//! # Example
//!
//! ```rust
//! use shardkeeper::error::{Error, Result};
//!
//! fn require_port(port: Option<i32>) -> Result<i32> {
//!     port.ok_or_else(|| Error::InvalidConfig {
//!         field: "port".into(),
//!         reason: "must be set".into(),
//!     })
//! }
//!
//! assert!(require_port(None).is_err());
//! ```

use thiserror::Error;

/// Main error type for shardkeeper operations.
#[derive(Error, Debug)]
pub enum Error {
    // Platform errors
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid workload update for {name}: {reason}")]
    InvalidUpdate { name: String, reason: String },

    // Node errors
    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Exec in pod {pod} failed: {reason}")]
    Exec { pod: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Topology errors
    #[error("Cluster is broken: {unhealthy} of {total} nodes unhealthy, manual intervention required")]
    ClusterBroken { unhealthy: usize, total: usize },

    #[error("{unhealthy} node(s) unhealthy, topology change paused")]
    UnhealthyNodes { unhealthy: usize },

    // Workload errors
    #[error("Failed to resize {} storage claim(s): {}", .failures.len(), .failures.join("; "))]
    ClaimResize { failures: Vec<String> },

    // Configuration errors
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code carried by a platform API error, if any.
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// The referenced resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || self.api_code() == Some(404)
    }

    /// The write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// The platform rejected the object as structurally invalid, e.g. a change
    /// to an immutable field.
    pub fn is_invalid(&self) -> bool {
        match self {
            Error::InvalidUpdate { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 422 || resp.reason == "Invalid",
            _ => false,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => {
                matches!(resp.code, 409 | 429 | 500 | 502 | 503 | 504)
            }
            Error::Kube(_) | Error::Io(_) | Error::Command { .. } | Error::Exec { .. } => true,
            _ => false,
        }
    }

    /// Short label used for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::NotFound(_) => "not_found",
            Error::InvalidUpdate { .. } => "invalid_update",
            Error::Command { .. } => "command",
            Error::Exec { .. } => "exec",
            Error::Protocol(_) => "protocol",
            Error::Io(_) => "io",
            Error::ClusterBroken { .. } => "cluster_broken",
            Error::UnhealthyNodes { .. } => "unhealthy_nodes",
            Error::ClaimResize { .. } => "claim_resize",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

/// Result type alias for shardkeeper operations.
pub type Result<T> = std::result::Result<T, Error>;
