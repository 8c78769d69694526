//! # Communication Module
//!
//! Delivery of federation messages to peers.
//!
//! [`PeerTransport`] is the seam between the protocol and the network. The production
//! implementation, [`HttpTransport`], posts JSON bodies to a peer's federation endpoints.
//! Tests wire nodes together in-process through `test_utils::MockTransport`.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    messages::{FederationMessage, HeartbeatRequest, NoticeRequest},
};

// Re-export NodeId from types module
pub use crate::types::NodeId;

/// Path of the heartbeat ingress endpoint
pub const HEARTBEAT_PATH: &str = "/federation/heartbeat";
/// Path of the handover intent endpoint
pub const HANDOVER_INTENT_PATH: &str = "/federation/handover/intent";
/// Path of the handover acknowledgment endpoint
pub const HANDOVER_ACK_PATH: &str = "/federation/handover/ack";

/// A peer and the base URL its federation endpoints live under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Peer identity
    pub node_id: NodeId,
    /// Base URL, e.g. `http://10.0.0.2:8787`
    pub endpoint: String,
}

impl PeerEndpoint {
    /// Create a peer endpoint
    pub fn new(node_id: impl Into<NodeId>, endpoint: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), endpoint: endpoint.into() }
    }

    /// Full URL for a path on this peer
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.endpoint)
    }
}

/// Delivers a single message to a single peer
#[async_trait]
pub trait PeerTransport: Send + Sync + fmt::Debug {
    /// Deliver `message` to `peer`; an error means the peer did not take it
    async fn deliver(&self, peer: &PeerEndpoint, message: &FederationMessage) -> Result<()>;
}

/// HTTP transport posting JSON bodies with reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    cluster_root: String,
}

impl HttpTransport {
    /// Create a transport stamping every body with `cluster_root`
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cluster_root: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::communication(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, cluster_root: cluster_root.into() })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn deliver(&self, peer: &PeerEndpoint, message: &FederationMessage) -> Result<()> {
        let request = match message {
            FederationMessage::Heartbeat(hb) => self
                .client
                .post(peer.url(HEARTBEAT_PATH))
                .json(&HeartbeatRequest::from_message(hb, self.cluster_root.clone())),
            FederationMessage::HandoverIntent(notice) => {
                self.client.post(peer.url(HANDOVER_INTENT_PATH)).json(&NoticeRequest {
                    cluster_root: self.cluster_root.clone(),
                    notice: notice.clone(),
                })
            },
            FederationMessage::HandoverAck(notice) => {
                self.client.post(peer.url(HANDOVER_ACK_PATH)).json(&NoticeRequest {
                    cluster_root: self.cluster_root.clone(),
                    notice: notice.clone(),
                })
            },
        };

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::communication(format!("request to {} timed out", peer.node_id))
            } else {
                Error::node_unavailable(&peer.node_id)
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(Error::communication(format!(
                "{} to {} failed: {status} {body}",
                message.message_type(),
                peer.node_id
            )))
        }
    }
}

/// Outcome of sending one message to every peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers that took the message
    pub delivered: Vec<NodeId>,
    /// Peers that did not, with the reason
    pub failed: Vec<(NodeId, String)>,
}

impl BroadcastReport {
    /// Number of peers attempted
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// A round succeeds when any peer took the message or there was nobody to send to
    pub fn is_success(&self) -> bool {
        !self.delivered.is_empty() || self.attempted() == 0
    }
}

/// Send `message` to every peer concurrently, each bounded by `send_timeout`
///
/// A slow or failing peer never holds up the others.
pub async fn broadcast(
    transport: &dyn PeerTransport,
    peers: &[PeerEndpoint],
    message: &FederationMessage,
    send_timeout: Duration,
) -> BroadcastReport {
    let sends = peers.iter().map(|peer| async move {
        let result = match tokio::time::timeout(send_timeout, transport.deliver(peer, message)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(
                format!("deliver {}", message.message_type()),
                u64::try_from(send_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };
        (peer, result)
    });

    let mut report = BroadcastReport::default();
    for (peer, result) in join_all(sends).await {
        match result {
            Ok(()) => {
                debug!(peer = %peer, message_type = message.message_type(), "Delivered");
                report.delivered.push(peer.node_id.clone());
            },
            Err(e) => {
                warn!(
                    peer = %peer,
                    message_type = message.message_type(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Delivery failed"
                );
                report.failed.push((peer.node_id.clone(), e.to_string()));
            },
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{messages::HeartbeatMessage, security::ClusterSeal, types::Epoch};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedTransport {
        down: Vec<NodeId>,
        hang: Vec<NodeId>,
        seen: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn deliver(&self, peer: &PeerEndpoint, _message: &FederationMessage) -> Result<()> {
            if self.hang.contains(&peer.node_id) {
                std::future::pending::<()>().await;
            }
            if self.down.contains(&peer.node_id) {
                return Err(Error::node_unavailable(&peer.node_id));
            }
            self.seen.lock().push(peer.node_id.clone());
            Ok(())
        }
    }

    fn message() -> FederationMessage {
        let seal = ClusterSeal::new("comm-seal", Duration::from_secs(300)).unwrap();
        FederationMessage::Heartbeat(HeartbeatMessage::signed(
            &seal,
            NodeId::from("self"),
            Epoch::new(1),
            1_700_000_000,
        ))
    }

    fn peers(ids: &[&str]) -> Vec<PeerEndpoint> {
        ids.iter().map(|id| PeerEndpoint::new(*id, format!("http://{id}:8787"))).collect()
    }

    #[test]
    fn test_peer_url_joins_cleanly() {
        let peer = PeerEndpoint::new("node-a", "http://10.0.0.2:8787/");
        assert_eq!(peer.url(HEARTBEAT_PATH), "http://10.0.0.2:8787/federation/heartbeat");
    }

    #[tokio::test]
    async fn test_one_failing_peer_does_not_block_others() {
        let transport = ScriptedTransport { down: vec![NodeId::from("b")], ..Default::default() };
        let report =
            broadcast(&transport, &peers(&["a", "b", "c"]), &message(), Duration::from_secs(1)).await;

        assert_eq!(report.delivered, vec![NodeId::from("a"), NodeId::from("c")]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_peer_is_bounded_by_timeout() {
        let transport = ScriptedTransport { hang: vec![NodeId::from("a")], ..Default::default() };
        let report =
            broadcast(&transport, &peers(&["a", "b"]), &message(), Duration::from_millis(500)).await;

        assert_eq!(report.delivered, vec![NodeId::from("b")]);
        assert_eq!(report.failed[0].0, NodeId::from("a"));
    }

    #[tokio::test]
    async fn test_round_with_no_peers_succeeds() {
        let transport = ScriptedTransport::default();
        let report = broadcast(&transport, &[], &message(), Duration::from_secs(1)).await;
        assert!(report.is_success());
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn test_round_with_all_peers_down_fails() {
        let transport = ScriptedTransport {
            down: vec![NodeId::from("a"), NodeId::from("b")],
            ..Default::default()
        };
        let report =
            broadcast(&transport, &peers(&["a", "b"]), &message(), Duration::from_secs(1)).await;
        assert!(!report.is_success());
    }
}
