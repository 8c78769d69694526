//! # Federation Message System
//!
//! Typed messages exchanged between federation nodes, and the JSON bodies that carry them
//! over HTTP.
//!
//! Three messages make up the protocol:
//!
//! - [`HeartbeatMessage`]: periodic liveness and epoch announcement
//! - [`HandoverNotice`] of kind [`NoticeKind::Intent`]: a new winner announcing it is about
//!   to take leadership
//! - [`HandoverNotice`] of kind [`NoticeKind::Ack`]: the old leader confirming it stepped down
//!
//! All of them are signed with the cluster seal (see [`crate::security`]). Wire bodies are
//! validated at the ingress boundary and converted into the typed messages before anything
//! else touches them.
//!
//! ## Usage
//!
//! ```rust
//! use federation_cluster::messages::{FederationMessage, HeartbeatMessage};
//! use federation_cluster::security::ClusterSeal;
//! use federation_cluster::types::{Epoch, NodeId};
//! use std::time::Duration;
//!
//! let seal = ClusterSeal::new("shared-secret", Duration::from_secs(300)).unwrap();
//! let heartbeat = HeartbeatMessage::signed(&seal, NodeId::from("node-a"), Epoch::new(3), 1_700_000_000);
//! let msg = FederationMessage::Heartbeat(heartbeat);
//!
//! assert_eq!(msg.message_type(), "Heartbeat");
//! assert_eq!(msg.sender().as_str(), "node-a");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    security::{ClusterSeal, VerificationFailure},
    types::{Epoch, NodeId},
};

/// Liveness status a node claims for itself in a heartbeat
///
/// Informational only; it is not covered by the signature and never affects elections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimedStatus {
    /// The sender reports itself healthy
    #[default]
    Alive,
    /// Anything else the sender reported
    Unknown,
}

impl ClaimedStatus {
    /// Parse the free-form wire status; anything but `"alive"` is `Unknown`
    pub fn from_wire(status: &str) -> Self {
        if status.eq_ignore_ascii_case("alive") {
            Self::Alive
        } else {
            Self::Unknown
        }
    }

    /// Wire rendering
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Unknown => "unknown",
        }
    }
}

/// Signed heartbeat announcing a node's identity and current epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Sending node
    pub node_id: NodeId,
    /// Sender's current epoch
    pub epoch: Epoch,
    /// Sender's clock at send time, Unix seconds
    pub sent_at: u64,
    /// Lowercase hex HMAC over `(node_id, epoch, sent_at)`
    pub signature: String,
    /// Self-reported status
    #[serde(default)]
    pub status: ClaimedStatus,
}

impl HeartbeatMessage {
    /// Build and sign a heartbeat
    pub fn signed(seal: &ClusterSeal, node_id: NodeId, epoch: Epoch, sent_at: u64) -> Self {
        let signature = seal.sign(node_id.as_bytes(), epoch, sent_at).to_hex();
        Self { node_id, epoch, sent_at, signature, status: ClaimedStatus::Alive }
    }

    /// Verify signature and freshness against the receiver's clock
    pub fn check(&self, seal: &ClusterSeal, now: DateTime<Utc>) -> Result<(), VerificationFailure> {
        if self.node_id.is_empty() {
            return Err(VerificationFailure::Malformed("empty node id".to_string()));
        }
        seal.check(self.node_id.as_bytes(), self.epoch, self.sent_at, &self.signature, now)
    }
}

/// Which side of a handover a notice comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Sent by the new winner before it promotes itself
    Intent,
    /// Sent by the old leader after it demoted itself
    Ack,
}

impl NoticeKind {
    const fn tag(&self) -> u8 {
        match self {
            Self::Intent => 1,
            Self::Ack => 2,
        }
    }
}

/// Signed handover intent or acknowledgment
///
/// The sender's `(from, epoch)` doubles as a heartbeat, so receivers refresh their peer view
/// from notices as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverNotice {
    /// Intent or acknowledgment
    pub kind: NoticeKind,
    /// Sending node
    pub from: NodeId,
    /// Leader being replaced
    pub old_leader_id: NodeId,
    /// Leader taking over
    pub new_leader_id: NodeId,
    /// Sender's current epoch
    pub epoch: Epoch,
    /// Sender's clock at send time, Unix seconds
    pub sent_at: u64,
    /// Lowercase hex HMAC over every field above
    pub signature: String,
}

impl HandoverNotice {
    /// Build and sign a notice
    pub fn signed(
        seal: &ClusterSeal,
        kind: NoticeKind,
        from: NodeId,
        old_leader_id: NodeId,
        new_leader_id: NodeId,
        epoch: Epoch,
        sent_at: u64,
    ) -> Self {
        let payload = notice_payload(kind, &from, &old_leader_id, &new_leader_id);
        let signature = seal.sign(&payload, epoch, sent_at).to_hex();
        Self { kind, from, old_leader_id, new_leader_id, epoch, sent_at, signature }
    }

    /// Verify signature and freshness against the receiver's clock
    pub fn check(&self, seal: &ClusterSeal, now: DateTime<Utc>) -> Result<(), VerificationFailure> {
        if self.from.is_empty() || self.old_leader_id.is_empty() || self.new_leader_id.is_empty() {
            return Err(VerificationFailure::Malformed("empty node id in notice".to_string()));
        }
        let payload = notice_payload(self.kind, &self.from, &self.old_leader_id, &self.new_leader_id);
        seal.check(&payload, self.epoch, self.sent_at, &self.signature, now)
    }
}

fn notice_payload(kind: NoticeKind, from: &NodeId, old: &NodeId, new: &NodeId) -> Vec<u8> {
    let mut payload = vec![kind.tag()];
    for id in [from, old, new] {
        let len = u32::try_from(id.as_bytes().len()).unwrap_or(u32::MAX);
        payload.extend_from_slice(&len.to_be_bytes());
        payload.extend_from_slice(id.as_bytes());
    }
    payload
}

/// Every message a node can deliver to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FederationMessage {
    /// Periodic heartbeat
    Heartbeat(HeartbeatMessage),
    /// Handover intent from a new winner
    HandoverIntent(HandoverNotice),
    /// Handover acknowledgment from an old leader
    HandoverAck(HandoverNotice),
}

impl FederationMessage {
    /// Human-readable message type for logs
    #[inline]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "Heartbeat",
            Self::HandoverIntent(_) => "HandoverIntent",
            Self::HandoverAck(_) => "HandoverAck",
        }
    }

    /// Node that produced the message
    pub fn sender(&self) -> &NodeId {
        match self {
            Self::Heartbeat(hb) => &hb.node_id,
            Self::HandoverIntent(notice) | Self::HandoverAck(notice) => &notice.from,
        }
    }

    /// Sender's epoch at send time
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Heartbeat(hb) => hb.epoch,
            Self::HandoverIntent(notice) | Self::HandoverAck(notice) => notice.epoch,
        }
    }
}

fn default_status() -> String {
    ClaimedStatus::Alive.as_str().to_string()
}

/// JSON body of `POST /federation/heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Sender's current epoch
    pub epoch: u64,
    /// Cluster the sender belongs to
    pub cluster_root: String,
    /// Lowercase hex signature
    pub sig: String,
    /// Sending node
    pub node_id: String,
    /// Self-reported status, `"alive"` when omitted
    #[serde(default = "default_status")]
    pub status: String,
    /// Sender's clock at send time, Unix seconds
    pub sent_at: u64,
}

impl HeartbeatRequest {
    /// Wrap a heartbeat for the wire
    pub fn from_message(message: &HeartbeatMessage, cluster_root: impl Into<String>) -> Self {
        Self {
            epoch: message.epoch.value(),
            cluster_root: cluster_root.into(),
            sig: message.signature.clone(),
            node_id: message.node_id.to_string(),
            status: message.status.as_str().to_string(),
            sent_at: message.sent_at,
        }
    }

    /// Convert into a typed heartbeat; the signature is not checked here
    pub fn to_message(&self) -> Result<HeartbeatMessage, VerificationFailure> {
        let node_id: NodeId = self
            .node_id
            .parse()
            .map_err(|_| VerificationFailure::Malformed("empty node id".to_string()))?;
        Ok(HeartbeatMessage {
            node_id,
            epoch: Epoch::new(self.epoch),
            sent_at: self.sent_at,
            signature: self.sig.clone(),
            status: ClaimedStatus::from_wire(&self.status),
        })
    }
}

/// Response to `POST /federation/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// The request was processed
    pub ok: bool,
    /// The heartbeat passed every check and was recorded
    pub valid: bool,
    /// Receiver clock minus `sent_at`, in seconds
    pub age_seconds: f64,
    /// Receiver clock at ingress
    pub received_at: DateTime<Utc>,
}

/// JSON body of `POST /federation/handover/{intent,ack}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeRequest {
    /// Cluster the sender belongs to
    pub cluster_root: String,
    /// The signed notice
    pub notice: HandoverNotice,
}

/// Response to a handover notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeResponse {
    /// The request was processed
    pub ok: bool,
    /// The notice passed every check
    pub valid: bool,
    /// Receiver clock at ingress
    pub received_at: DateTime<Utc>,
}
