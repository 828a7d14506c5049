//! Error types for the rebalancing protocol.

use thiserror::Error;

/// Classified error taxonomy surfaced by the coordination layer.
///
/// Transient connection loss never appears here: it is retried below this
/// layer and only the outcomes callers must act on are surfaced.
#[derive(Error, Debug)]
pub enum RebalancerError {
    /// The store session has expired; every ephemeral node of it is gone.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// A compare-and-set lost against a newer version (fencing).
    #[error("Stale version: {0}")]
    StaleVersion(String),

    /// The caller's cancellation signal fired while waiting.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Unclassified or structurally unexpected store failure.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A watch could not be set because the ephemeral node is already gone.
    #[error("Ephemeral node missing: {0}")]
    NoEphemeralNode(String),

    /// A multi-step write partially succeeded and cannot be safely retried.
    #[error("Potentially inconsistent state: {0}")]
    InconsistentState(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The client is not in a state that allows the requested operation.
    #[error("Invalid client state: {0}")]
    InvalidState(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RebalancerError {
    /// Check if this error ends the current session's engine loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RebalancerError::SessionExpired(_)
                | RebalancerError::InvalidOperation(_)
                | RebalancerError::InconsistentState(_)
                | RebalancerError::Serialization(_)
        )
    }

    /// Check if this error means another writer advanced the state first.
    pub fn is_fenced(&self) -> bool {
        matches!(self, RebalancerError::StaleVersion(_))
    }

    /// Get a stable error code for logs and events.
    pub fn error_code(&self) -> &'static str {
        match self {
            RebalancerError::SessionExpired(_) => "SESSION_EXPIRED",
            RebalancerError::StaleVersion(_) => "STALE_VERSION",
            RebalancerError::Cancelled(_) => "CANCELLED",
            RebalancerError::InvalidOperation(_) => "INVALID_OPERATION",
            RebalancerError::NoEphemeralNode(_) => "NO_EPHEMERAL_NODE",
            RebalancerError::InconsistentState(_) => "INCONSISTENT_STATE",
            RebalancerError::Configuration(_) => "CONFIGURATION_ERROR",
            RebalancerError::InvalidState(_) => "INVALID_STATE",
            RebalancerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Result type alias for rebalancer operations.
pub type Result<T> = std::result::Result<T, RebalancerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RebalancerError::SessionExpired("x".into()).is_fatal());
        assert!(RebalancerError::InconsistentState("x".into()).is_fatal());
        assert!(!RebalancerError::Cancelled("x".into()).is_fatal());
        assert!(!RebalancerError::StaleVersion("x".into()).is_fatal());
        assert!(RebalancerError::StaleVersion("x".into()).is_fenced());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RebalancerError::NoEphemeralNode("c_1".into()).error_code(),
            "NO_EPHEMERAL_NODE"
        );
        assert_eq!(
            RebalancerError::Configuration("bad".into()).to_string(),
            "Configuration error: bad"
        );
    }
}
