//! Raw store adapter errors.

use rebalancer_common::RebalancerError;
use thiserror::Error;

/// Failure reported by a coordination store call, before classification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The connection to the store was lost; the outcome of the call is unknown.
    #[error("Connection lost")]
    ConnectionLoss,

    /// The node does not exist.
    #[error("No node: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("Node exists: {0}")]
    NodeExists(String),

    /// The expected version did not match.
    #[error("Bad version for {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// The node has children.
    #[error("Node not empty: {0}")]
    NotEmpty(String),

    /// Ephemeral nodes cannot have children.
    #[error("No children for ephemerals: {0}")]
    NoChildrenForEphemerals(String),

    /// The session has expired.
    #[error("Session expired")]
    SessionExpired,

    /// The session was closed locally.
    #[error("Session closed")]
    Closed,

    /// Any other adapter failure.
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Check if the call may simply be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }
}

/// Unclassified fallback: anything that reaches here is an invalid operation
/// unless it is a session or fencing outcome.
impl From<StoreError> for RebalancerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionExpired => RebalancerError::SessionExpired(err.to_string()),
            StoreError::BadVersion { .. } => RebalancerError::StaleVersion(err.to_string()),
            StoreError::Closed => RebalancerError::Cancelled(err.to_string()),
            other => RebalancerError::InvalidOperation(other.to_string()),
        }
    }
}

/// Result type for raw store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
