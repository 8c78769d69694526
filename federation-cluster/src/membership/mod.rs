//! # Membership Module
//!
//! The local node's view of its peers, built from verified heartbeats and handover notices.
//!
//! Records carry the *receiver's* clock as `last_seen_at`; sender clocks are only used for
//! the freshness check during verification. A record whose `last_seen_at` is older than the
//! stale threshold is kept for observability but excluded from elections.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

pub use crate::messages::ClaimedStatus;
use crate::{
    messages::{HandoverNotice, HeartbeatMessage},
    security::{ClusterSeal, VerificationFailure},
    time::{elapsed_since, SharedClock},
    types::{Epoch, NodeId},
};

/// Per-peer view entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Peer identity
    pub node_id: NodeId,
    /// Highest epoch observed from this peer
    pub epoch: Epoch,
    /// Receiver's clock when the latest valid message arrived
    pub last_seen_at: DateTime<Utc>,
    /// Status the peer reported for itself
    pub claimed_status: ClaimedStatus,
    /// Whether the latest message carried a valid signature
    pub signature_valid: bool,
}

impl NodeRecord {
    /// A record is stale when it has not been refreshed within `threshold`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        elapsed_since(now, self.last_seen_at) > threshold
    }

    /// Eligible to take part in an election
    pub fn is_viable(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.signature_valid && !self.is_stale(now, threshold)
    }

    /// Seconds since the record was last refreshed
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_since(now, self.last_seen_at)
    }
}

/// Why an inbound message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// MAC mismatch
    BadSignature,
    /// `sent_at` outside the freshness window
    OutsideFreshnessWindow,
    /// Unparseable signature or identity
    Malformed,
    /// Message addressed to a different cluster root
    WrongCluster,
    /// Our own heartbeat reflected back
    SelfEcho,
}

impl From<&VerificationFailure> for RejectionReason {
    fn from(failure: &VerificationFailure) -> Self {
        match failure {
            VerificationFailure::Malformed(_) => Self::Malformed,
            VerificationFailure::OutsideFreshnessWindow { .. } => Self::OutsideFreshnessWindow,
            VerificationFailure::BadSignature => Self::BadSignature,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::BadSignature => "bad_signature",
            Self::OutsideFreshnessWindow => "outside_freshness_window",
            Self::Malformed => "malformed",
            Self::WrongCluster => "wrong_cluster",
            Self::SelfEcho => "self_echo",
        };
        f.write_str(reason)
    }
}

/// Result of ingesting one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The message verified and the record was upserted
    Accepted {
        /// Record after the upsert
        record: NodeRecord,
        /// Whether this message raised the stored epoch (or created the record)
        epoch_advanced: bool,
    },
    /// The message was dropped; no record changed
    Rejected(RejectionReason),
}

impl IngestOutcome {
    /// Whether the message was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Default)]
struct IngressCounters {
    accepted: AtomicU64,
    bad_signature: AtomicU64,
    outside_freshness_window: AtomicU64,
    malformed: AtomicU64,
    wrong_cluster: AtomicU64,
    self_echo: AtomicU64,
}

/// Snapshot of ingress counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerViewStats {
    /// Messages accepted into the view
    pub accepted: u64,
    /// Rejected for MAC mismatch
    pub rejected_bad_signature: u64,
    /// Rejected as replayed or future-dated
    pub rejected_outside_freshness_window: u64,
    /// Rejected as unparseable
    pub rejected_malformed: u64,
    /// Rejected for a foreign cluster root
    pub rejected_wrong_cluster: u64,
    /// Own heartbeats ignored
    pub self_echo: u64,
}

impl PeerViewStats {
    /// Total rejections across all reasons
    pub fn total_rejected(&self) -> u64 {
        self.rejected_bad_signature
            + self.rejected_outside_freshness_window
            + self.rejected_malformed
            + self.rejected_wrong_cluster
            + self.self_echo
    }
}

/// The local node's view of the federation
pub struct PeerView {
    self_id: NodeId,
    seal: Arc<ClusterSeal>,
    clock: SharedClock,
    records: RwLock<HashMap<NodeId, NodeRecord>>,
    self_last_seen: RwLock<DateTime<Utc>>,
    counters: IngressCounters,
}

impl PeerView {
    /// Create an empty view; the self-record starts at boot time
    pub fn new(self_id: NodeId, seal: Arc<ClusterSeal>, clock: SharedClock) -> Self {
        let boot = clock.now();
        Self {
            self_id,
            seal,
            clock,
            records: RwLock::new(HashMap::new()),
            self_last_seen: RwLock::new(boot),
            counters: IngressCounters::default(),
        }
    }

    /// The local node's identity
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Verify a heartbeat and upsert the sender's record
    pub fn ingest(&self, heartbeat: &HeartbeatMessage) -> IngestOutcome {
        if heartbeat.node_id == self.self_id {
            return self.reject(RejectionReason::SelfEcho, &heartbeat.node_id);
        }

        let now = self.clock.now();
        if let Err(failure) = heartbeat.check(&self.seal, now) {
            debug!(node_id = %heartbeat.node_id, %failure, "Heartbeat failed verification");
            return self.reject(RejectionReason::from(&failure), &heartbeat.node_id);
        }

        self.upsert(&heartbeat.node_id, heartbeat.epoch, heartbeat.status, now)
    }

    /// Verify a handover notice and refresh the sender's record from it
    pub fn ingest_notice(&self, notice: &HandoverNotice) -> IngestOutcome {
        if notice.from == self.self_id {
            return self.reject(RejectionReason::SelfEcho, &notice.from);
        }

        let now = self.clock.now();
        if let Err(failure) = notice.check(&self.seal, now) {
            debug!(node_id = %notice.from, kind = ?notice.kind, %failure, "Notice failed verification");
            return self.reject(RejectionReason::from(&failure), &notice.from);
        }

        self.upsert(&notice.from, notice.epoch, ClaimedStatus::Alive, now)
    }

    /// Count a rejection decided outside the view (for example a foreign cluster root)
    pub fn record_rejection(&self, reason: RejectionReason) {
        let counter = match reason {
            RejectionReason::BadSignature => &self.counters.bad_signature,
            RejectionReason::OutsideFreshnessWindow => &self.counters.outside_freshness_window,
            RejectionReason::Malformed => &self.counters.malformed,
            RejectionReason::WrongCluster => &self.counters.wrong_cluster,
            RejectionReason::SelfEcho => &self.counters.self_echo,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self, reason: RejectionReason, sender: &NodeId) -> IngestOutcome {
        self.record_rejection(reason);
        if reason != RejectionReason::SelfEcho {
            warn!(node_id = %sender, %reason, "Dropped federation message");
        }
        IngestOutcome::Rejected(reason)
    }

    fn upsert(
        &self,
        node_id: &NodeId,
        epoch: Epoch,
        status: ClaimedStatus,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        let mut records = self.records.write();
        let (record, epoch_advanced) = match records.get_mut(node_id) {
            Some(existing) => {
                // Reordered delivery never moves an epoch backwards
                let advanced = epoch > existing.epoch;
                if epoch >= existing.epoch {
                    existing.epoch = epoch;
                }
                existing.last_seen_at = now;
                existing.claimed_status = status;
                existing.signature_valid = true;
                (existing.clone(), advanced)
            },
            None => {
                let record = NodeRecord {
                    node_id: node_id.clone(),
                    epoch,
                    last_seen_at: now,
                    claimed_status: status,
                    signature_valid: true,
                };
                records.insert(node_id.clone(), record.clone());
                (record, true)
            },
        };
        drop(records);

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(node_id = %node_id, epoch = %record.epoch, "Peer record refreshed");
        IngestOutcome::Accepted { record, epoch_advanced }
    }

    /// Record a successful outbound broadcast round
    pub fn mark_self_seen(&self, at: DateTime<Utc>) {
        let mut last = self.self_last_seen.write();
        if at > *last {
            *last = at;
        }
    }

    /// Time of the last successful broadcast round, or boot time
    pub fn self_last_seen(&self) -> DateTime<Utc> {
        *self.self_last_seen.read()
    }

    /// Look up a single peer record
    pub fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.records.read().get(node_id).cloned()
    }

    /// Peer records only, sorted by node id
    pub fn peers(&self) -> Vec<NodeRecord> {
        let mut peers: Vec<NodeRecord> = self.records.read().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Every peer record plus a synthetic record for the local node at `self_epoch`
    pub fn snapshot(&self, self_epoch: Epoch) -> Vec<NodeRecord> {
        let mut records = self.peers();
        records.push(NodeRecord {
            node_id: self.self_id.clone(),
            epoch: self_epoch,
            last_seen_at: self.self_last_seen(),
            claimed_status: ClaimedStatus::Alive,
            signature_valid: true,
        });
        records
    }

    /// Ingress counters
    pub fn stats(&self) -> PeerViewStats {
        let c = &self.counters;
        PeerViewStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected_bad_signature: c.bad_signature.load(Ordering::Relaxed),
            rejected_outside_freshness_window: c.outside_freshness_window.load(Ordering::Relaxed),
            rejected_malformed: c.malformed.load(Ordering::Relaxed),
            rejected_wrong_cluster: c.wrong_cluster.load(Ordering::Relaxed),
            self_echo: c.self_echo.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for PeerView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerView")
            .field("self_id", &self.self_id)
            .field("peers", &self.records.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::NoticeKind,
        time::{unix_seconds, Clock, ManualClock},
    };

    const STALE: Duration = Duration::from_secs(300);

    fn setup() -> (Arc<ManualClock>, Arc<ClusterSeal>, PeerView) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let seal = Arc::new(ClusterSeal::new("membership-seal", Duration::from_secs(300)).unwrap());
        let view = PeerView::new(NodeId::from("self"), Arc::clone(&seal), clock.clone());
        (clock, seal, view)
    }

    fn heartbeat(seal: &ClusterSeal, clock: &ManualClock, id: &str, epoch: u64) -> HeartbeatMessage {
        HeartbeatMessage::signed(seal, NodeId::from(id), Epoch::new(epoch), unix_seconds(clock.now()))
    }

    #[test]
    fn test_valid_heartbeat_upserts_record() {
        let (clock, seal, view) = setup();
        let outcome = view.ingest(&heartbeat(&seal, &clock, "node-a", 5));

        match outcome {
            IngestOutcome::Accepted { record, epoch_advanced } => {
                assert_eq!(record.epoch, Epoch::new(5));
                assert_eq!(record.last_seen_at, clock.now());
                assert!(record.signature_valid);
                assert!(epoch_advanced);
            },
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(view.stats().accepted, 1);
    }

    #[test]
    fn test_epoch_never_regresses() {
        let (clock, seal, view) = setup();
        view.ingest(&heartbeat(&seal, &clock, "node-a", 9));
        clock.advance(Duration::from_secs(5));
        let outcome = view.ingest(&heartbeat(&seal, &clock, "node-a", 3));

        let record = view.get(&NodeId::from("node-a")).unwrap();
        assert_eq!(record.epoch, Epoch::new(9));
        assert_eq!(record.last_seen_at, clock.now());
        assert!(matches!(outcome, IngestOutcome::Accepted { epoch_advanced: false, .. }));
    }

    #[test]
    fn test_bad_signature_leaves_view_untouched() {
        let (clock, seal, view) = setup();
        view.ingest(&heartbeat(&seal, &clock, "node-a", 2));
        let before = view.get(&NodeId::from("node-a")).unwrap();

        clock.advance(Duration::from_secs(30));
        let mut forged = heartbeat(&seal, &clock, "node-a", 50);
        forged.signature = "ab".repeat(32);

        assert_eq!(view.ingest(&forged), IngestOutcome::Rejected(RejectionReason::BadSignature));
        assert_eq!(view.get(&NodeId::from("node-a")).unwrap(), before);
        assert_eq!(view.stats().rejected_bad_signature, 1);
    }

    #[test]
    fn test_replayed_heartbeat_rejected() {
        let (clock, seal, view) = setup();
        let captured = heartbeat(&seal, &clock, "node-a", 2);
        clock.advance(Duration::from_secs(301));

        assert_eq!(
            view.ingest(&captured),
            IngestOutcome::Rejected(RejectionReason::OutsideFreshnessWindow)
        );
        assert!(view.get(&NodeId::from("node-a")).is_none());
    }

    #[test]
    fn test_self_echo_ignored() {
        let (clock, seal, view) = setup();
        let outcome = view.ingest(&heartbeat(&seal, &clock, "self", 100));

        assert_eq!(outcome, IngestOutcome::Rejected(RejectionReason::SelfEcho));
        assert!(view.peers().is_empty());
        assert_eq!(view.stats().self_echo, 1);
    }

    #[test]
    fn test_notice_refreshes_sender() {
        let (clock, seal, view) = setup();
        let notice = HandoverNotice::signed(
            &seal,
            NoticeKind::Intent,
            NodeId::from("node-b"),
            NodeId::from("self"),
            NodeId::from("node-b"),
            Epoch::new(11),
            unix_seconds(clock.now()),
        );

        assert!(view.ingest_notice(&notice).is_accepted());
        assert_eq!(view.get(&NodeId::from("node-b")).unwrap().epoch, Epoch::new(11));
    }

    #[test]
    fn test_stale_records_are_retained() {
        let (clock, seal, view) = setup();
        view.ingest(&heartbeat(&seal, &clock, "node-a", 2));
        clock.advance(Duration::from_secs(301));

        let record = view.get(&NodeId::from("node-a")).unwrap();
        assert!(record.is_stale(clock.now(), STALE));
        assert!(!record.is_viable(clock.now(), STALE));
        assert_eq!(view.peers().len(), 1);
    }

    #[test]
    fn test_snapshot_includes_self_record() {
        let (clock, seal, view) = setup();
        view.ingest(&heartbeat(&seal, &clock, "node-a", 2));
        clock.advance(Duration::from_secs(10));
        view.mark_self_seen(clock.now());

        let snapshot = view.snapshot(Epoch::new(7));
        let own = snapshot.iter().find(|r| r.node_id.as_str() == "self").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(own.epoch, Epoch::new(7));
        assert_eq!(own.last_seen_at, clock.now());
    }

    #[test]
    fn test_mark_self_seen_is_monotonic() {
        let (clock, _seal, view) = setup();
        let boot = view.self_last_seen();
        clock.advance(Duration::from_secs(60));
        view.mark_self_seen(clock.now());
        view.mark_self_seen(boot);

        assert_eq!(view.self_last_seen(), clock.now());
    }
}
