//! # Leadership Handover
//!
//! Time-bounded handover between an outgoing and an incoming leader.
//!
//! When a node wins an election while the old leader is still reachable, it publishes a
//! signed intent and waits up to the handover window for the old leader's acknowledgment.
//! The wait never blocks the takeover: once the window closes the new winner proceeds
//! either way, so overlapping authority is bounded by the window.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

pub mod handover;

pub use handover::{HandoverOrchestrator, HandoverRecord, HandoverTransaction};

/// Handover errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandoverError {
    /// A handover is already waiting for an acknowledgment
    #[error("Handover from {old_leader_id} already in progress")]
    AlreadyInProgress {
        /// Leader the running handover replaces
        old_leader_id: NodeId,
    },

    /// A node cannot hand over to itself
    #[error("Node {node_id} cannot hand over leadership to itself")]
    SelfHandover {
        /// The node in question
        node_id: NodeId,
    },
}

/// Handover result type
pub type HandoverResult<T> = std::result::Result<T, HandoverError>;

/// How a handover ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverOutcome {
    /// The old leader acknowledged within the window
    Acknowledged,
    /// The window elapsed without an acknowledgment
    DeadlineElapsed,
}

impl From<HandoverError> for crate::error::Error {
    fn from(err: HandoverError) -> Self {
        Self::consensus(err)
    }
}
