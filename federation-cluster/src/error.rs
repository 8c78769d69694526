//! # Federation Error Handling
//!
//! Crate-wide error type. Message verification failures are not errors here: they are
//! reported as [`VerificationFailure`](crate::security::VerificationFailure) and counted by
//! the peer view, because a rejected heartbeat is routine.

use thiserror::Error;

/// Federation errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Delivery to a peer failed
    #[error("Communication error: {0}")]
    Communication(String),

    /// Consensus coordinator errors
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// Peer not reachable through the transport
    #[error("Node unavailable: {node_id}")]
    NodeUnavailable {
        /// Unreachable peer
        node_id: String,
    },

    /// A bounded wait expired
    #[error("Federation operation timeout: {operation} after {timeout_ms}ms")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Bound in milliseconds
        timeout_ms: u64,
    },

    /// Promotion attempted at an epoch the node does not hold
    #[error("Epoch mismatch: node holds {expected}, promotion asked for {actual}")]
    EpochMismatch {
        /// The node's current epoch
        expected: u64,
        /// The epoch promotion was requested at
        actual: u64,
    },

    /// A privileged command was issued on a node that is not the leader
    #[error("Not leader: current leader is {leader_id:?}")]
    NotLeader {
        /// Best-known current leader
        leader_id: Option<String>,
    },

    /// Orchestration action name not recognized
    #[error("Unknown orchestration action: {0}")]
    UnknownAction(String),

    /// Missing or unusable cluster seal
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Configuration validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl Error {
    /// Create a new configuration error
    pub fn configuration<T: std::fmt::Display>(message: T) -> Self {
        Self::Configuration(message.to_string())
    }

    /// Create a new communication error
    pub fn communication<T: std::fmt::Display>(message: T) -> Self {
        Self::Communication(message.to_string())
    }

    /// Create a new consensus error
    pub fn consensus<T: std::fmt::Display>(message: T) -> Self {
        Self::Consensus(message.to_string())
    }

    /// Create a timeout error
    pub fn timeout<T: std::fmt::Display>(operation: T, timeout_ms: u64) -> Self {
        Self::Timeout { operation: operation.to_string(), timeout_ms }
    }

    /// Create a node unavailable error
    pub fn node_unavailable<T: std::fmt::Display>(node_id: T) -> Self {
        Self::NodeUnavailable { node_id: node_id.to_string() }
    }

    /// Whether the next heartbeat or consensus interval may succeed where this failed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::NodeUnavailable { .. } | Self::Timeout { .. })
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::Validation(_) => "configuration",
            Self::Communication(_) | Self::NodeUnavailable { .. } | Self::Timeout { .. } => {
                "communication"
            },
            Self::Consensus(_) | Self::EpochMismatch { .. } => "consensus",
            Self::NotLeader { .. } | Self::UnknownAction(_) => "authorization",
            Self::Authentication(_) => "security",
        }
    }
}

/// A specialized `Result` type for federation operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_helpers() {
        let err = Error::node_unavailable("node-a");
        assert_eq!(err.to_string(), "Node unavailable: node-a");
        assert!(err.is_retryable());
        assert_eq!(err.category(), "communication");
    }

    #[test]
    fn test_not_leader_is_not_retryable() {
        let err = Error::NotLeader { leader_id: Some("node-b".to_string()) };
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "authorization");
    }

    #[test]
    fn test_handover_error_maps_to_consensus() {
        let err: Error =
            crate::ha::HandoverError::SelfHandover { node_id: "node-a".into() }.into();
        assert!(matches!(err, Error::Consensus(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "consensus");
    }

    #[test]
    fn test_epoch_mismatch_message() {
        let err = Error::EpochMismatch { expected: 8, actual: 7 };
        assert_eq!(err.to_string(), "Epoch mismatch: node holds 8, promotion asked for 7");
        assert_eq!(err.category(), "consensus");
    }
}
