//! # Consensus Module
//!
//! Epoch-ordered leader election over the local peer view.
//!
//! There is no voting and no replicated log. Each node runs [`elect`] over the signed,
//! non-stale records it has observed; the highest epoch wins and ties go to the
//! lexicographically lowest node id. Because the rule is a pure function of the snapshot,
//! nodes holding the same view agree on the same winner.
//!
//! The [`ConsensusCoordinator`] turns election results into role transitions. Passes are
//! serialized, so a periodic pass, a watchdog pass and an intent-triggered pass never
//! interleave.
//!
//! Partitions can still produce two leaders for a while; see the crate documentation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::Result,
    ha::{HandoverOrchestrator, HandoverOutcome},
    heartbeat::HeartbeatBroadcaster,
    membership::{NodeRecord, PeerView},
    role::RoleStateMachine,
    time::{elapsed_since, SharedClock},
    types::{Epoch, NodeId},
};

/// Why an election picked its winner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionReason {
    /// No other viable node is visible; the local node elects itself
    NoViablePeers,
    /// Highest epoch among viable records
    EpochElection,
}

/// Outcome of one election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResult {
    /// Elected node
    pub winner_id: NodeId,
    /// Epoch the winner was elected at
    pub winner_epoch: Epoch,
    /// Why it won
    pub reason: ElectionReason,
}

/// Records eligible for election: signed and not stale
pub fn viable<'a>(
    records: &'a [NodeRecord],
    now: DateTime<Utc>,
    stale_threshold: Duration,
) -> impl Iterator<Item = &'a NodeRecord> + 'a {
    records.iter().filter(move |r| r.is_viable(now, stale_threshold))
}

/// Highest epoch among viable records, if any
pub fn max_viable_epoch(
    records: &[NodeRecord],
    now: DateTime<Utc>,
    stale_threshold: Duration,
) -> Option<Epoch> {
    viable(records, now, stale_threshold).map(|r| r.epoch).max()
}

/// Elect a leader from `records`
///
/// `records` normally comes from [`PeerView::snapshot`] and includes the local node's own
/// record. When no viable record other than the local node's remains, the local node
/// elects itself at `self_epoch`.
pub fn elect(
    self_id: &NodeId,
    self_epoch: Epoch,
    records: &[NodeRecord],
    now: DateTime<Utc>,
    stale_threshold: Duration,
) -> ElectionResult {
    let candidates: Vec<&NodeRecord> = viable(records, now, stale_threshold).collect();

    if candidates.iter().all(|r| &r.node_id == self_id) {
        return ElectionResult {
            winner_id: self_id.clone(),
            winner_epoch: self_epoch,
            reason: ElectionReason::NoViablePeers,
        };
    }

    // Highest epoch; on equal epochs the lower node id ranks higher
    let winner = candidates
        .into_iter()
        .max_by(|a, b| a.epoch.cmp(&b.epoch).then_with(|| b.node_id.cmp(&a.node_id)));

    match winner {
        Some(w) => ElectionResult {
            winner_id: w.node_id.clone(),
            winner_epoch: w.epoch,
            reason: ElectionReason::EpochElection,
        },
        None => ElectionResult {
            winner_id: self_id.clone(),
            winner_epoch: self_epoch,
            reason: ElectionReason::NoViablePeers,
        },
    }
}

/// What started a consensus pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassTrigger {
    /// The fixed consensus interval
    Interval,
    /// The watchdog found the believed leader stale or missing
    LeaderLost,
    /// A peer announced a handover
    HandoverIntent,
    /// The local leader accepted a heartbeat carrying a higher epoch
    HigherEpochSeen,
    /// Requested explicitly
    Manual,
}

/// What a consensus pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Own broadcasting has failed for longer than the stale threshold; stayed or became Witness
    SelfPartitioned,
    /// Another node won; this node follows it
    Following {
        /// The elected leader
        leader: NodeId,
        /// Whether this node stepped down during the pass
        demoted: bool,
    },
    /// This node won and now leads
    Leading {
        /// Epoch the node leads at
        epoch: Epoch,
        /// Whether the pass promoted the node (false when it already led)
        promoted: bool,
        /// Result of the handover, when one was needed
        handover: Option<HandoverOutcome>,
    },
}

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStats {
    /// Passes run
    pub passes: u64,
    /// Times the node raised its epoch to contend
    pub contentions: u64,
    /// Times the watchdog declared the leader lost
    pub leader_losses: u64,
}

/// Turns elections into role transitions for the local node
pub struct ConsensusCoordinator {
    node_id: NodeId,
    clock: SharedClock,
    peer_view: Arc<PeerView>,
    role: Arc<RoleStateMachine>,
    broadcaster: Arc<HeartbeatBroadcaster>,
    handover: Arc<HandoverOrchestrator>,
    stale_threshold: Duration,
    consensus_interval: Duration,
    leader_poll_interval: Duration,
    first_pass_delay: Duration,
    pass_lock: Mutex<()>,
    last_election: RwLock<Option<ElectionResult>>,
    passes: AtomicU64,
    contentions: AtomicU64,
    leader_losses: AtomicU64,
}

/// Timing knobs for the coordinator
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorTiming {
    /// Age after which a record no longer counts
    pub stale_threshold: Duration,
    /// Period of the fixed consensus pass
    pub consensus_interval: Duration,
    /// Period of the leader watchdog
    pub leader_poll_interval: Duration,
    /// Delay before the first periodic pass, giving heartbeats time to arrive
    pub first_pass_delay: Duration,
}

impl ConsensusCoordinator {
    /// Create a coordinator over the node's components
    pub fn new(
        clock: SharedClock,
        peer_view: Arc<PeerView>,
        role: Arc<RoleStateMachine>,
        broadcaster: Arc<HeartbeatBroadcaster>,
        handover: Arc<HandoverOrchestrator>,
        timing: CoordinatorTiming,
    ) -> Self {
        Self {
            node_id: role.node_id().clone(),
            clock,
            peer_view,
            role,
            broadcaster,
            handover,
            stale_threshold: timing.stale_threshold,
            consensus_interval: timing.consensus_interval,
            leader_poll_interval: timing.leader_poll_interval,
            first_pass_delay: timing.first_pass_delay,
            pass_lock: Mutex::new(()),
            last_election: RwLock::new(None),
            passes: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
            leader_losses: AtomicU64::new(0),
        }
    }

    /// Run `elect` over the current peer view
    pub fn elect_now(&self) -> ElectionResult {
        let now = self.clock.now();
        let epoch = self.role.current_epoch();
        let records = self.peer_view.snapshot(epoch);
        let result = elect(&self.node_id, epoch, &records, now, self.stale_threshold);
        *self.last_election.write() = Some(result.clone());
        result
    }

    /// Most recent election result
    pub fn last_election(&self) -> Option<ElectionResult> {
        self.last_election.read().clone()
    }

    /// Whether the local node's own broadcasting has been failing past the stale threshold
    pub fn is_self_partitioned(&self) -> bool {
        elapsed_since(self.clock.now(), self.peer_view.self_last_seen()) > self.stale_threshold
    }

    /// Raise the local epoch above every viable epoch and announce it
    pub async fn contend(&self) -> Epoch {
        let now = self.clock.now();
        let current = self.role.current_epoch();
        let records = self.peer_view.snapshot(current);
        let highest = max_viable_epoch(&records, now, self.stale_threshold).unwrap_or(current);
        let target = highest.max(current).next();

        let epoch = self.role.advance_epoch(target);
        self.contentions.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %self.node_id, %epoch, "Contending for leadership");

        self.broadcaster.broadcast_now().await;
        epoch
    }

    /// Run one consensus pass
    ///
    /// # Errors
    /// Fails only if promotion is attempted at an epoch other than the node's own, which a
    /// serialized pass never does.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run_pass(&self, trigger: PassTrigger) -> Result<PassOutcome> {
        let _guard = self.pass_lock.lock().await;
        self.passes.fetch_add(1, Ordering::Relaxed);

        if self.is_self_partitioned() {
            warn!(
                last_broadcast = %self.peer_view.self_last_seen(),
                "Own heartbeats have not reached any peer within the stale threshold"
            );
            self.role.demote(None, "self-partitioned");
            return Ok(PassOutcome::SelfPartitioned);
        }

        let mut result = self.elect_now();
        debug!(winner = %result.winner_id, epoch = %result.winner_epoch, reason = ?result.reason, "Election");
        if result.winner_id != self.node_id {
            return Ok(self.follow(&result).await);
        }

        if self.has_epoch_rival(&result) {
            self.contend().await;
            result = self.elect_now();
            if result.winner_id != self.node_id {
                return Ok(self.follow(&result).await);
            }
        }

        if self.role.is_leader() {
            return Ok(PassOutcome::Leading {
                epoch: self.role.current_epoch(),
                promoted: false,
                handover: None,
            });
        }

        let mut handover = None;
        if let Some(old_leader) = self.reachable_other_leader() {
            match self.handover.run(old_leader, result.winner_epoch).await {
                Ok(record) => handover = Some(record.outcome),
                Err(e) => warn!(error = %e, "Handover could not start, promoting without it"),
            }

            // The world may have moved during the window
            result = self.elect_now();
            if result.winner_id != self.node_id {
                return Ok(self.follow(&result).await);
            }
        }

        let transition = self.role.promote(result.winner_epoch)?;
        info!(epoch = %result.winner_epoch, ?trigger, ?transition, "Holding leadership");
        Ok(PassOutcome::Leading { epoch: result.winner_epoch, promoted: true, handover })
    }

    async fn follow(&self, result: &ElectionResult) -> PassOutcome {
        let leader = result.winner_id.clone();
        let demoted = if self.role.is_leader() {
            self.role.demote(Some(leader.clone()), "outranked by higher epoch");
            let report = self.handover.send_ack(&leader, self.role.current_epoch()).await;
            debug!(delivered = report.delivered.len(), "Handover acknowledgment sent");
            true
        } else {
            self.role.observe_leader(leader.clone());
            false
        };
        PassOutcome::Following { leader, demoted }
    }

    fn has_epoch_rival(&self, result: &ElectionResult) -> bool {
        let now = self.clock.now();
        self.peer_view
            .peers()
            .iter()
            .any(|r| r.epoch == result.winner_epoch && r.is_viable(now, self.stale_threshold))
    }

    fn reachable_other_leader(&self) -> Option<NodeId> {
        let leader = self.role.leader_id()?;
        if leader == self.node_id {
            return None;
        }
        let record = self.peer_view.get(&leader)?;
        record.is_viable(self.clock.now(), self.stale_threshold).then_some(leader)
    }

    /// Whether the believed leader is another node whose record is stale or gone
    pub fn leader_lost(&self) -> bool {
        match self.role.leader_id() {
            Some(leader) if leader != self.node_id => match self.peer_view.get(&leader) {
                Some(record) => record.is_stale(self.clock.now(), self.stale_threshold),
                None => true,
            },
            _ => false,
        }
    }

    /// One watchdog tick: contend and re-elect if the leader is gone
    pub async fn check_leader(&self) -> Option<PassOutcome> {
        if !self.leader_lost() {
            return None;
        }

        self.leader_losses.fetch_add(1, Ordering::Relaxed);
        warn!(node_id = %self.node_id, leader = ?self.role.leader_id(), "Leader believed lost");
        self.contend().await;
        match self.run_pass(PassTrigger::LeaderLost).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "Consensus pass after leader loss failed");
                None
            },
        }
    }

    /// Run a pass every `consensus_interval` until shutdown
    pub fn spawn_interval(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let start = Instant::now() + coordinator.first_pass_delay;
            let mut ticker = interval_at(start, coordinator.consensus_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.run_pass(PassTrigger::Interval).await {
                            warn!(error = %e, category = e.category(), "Consensus pass failed");
                        }
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Consensus interval task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Poll the believed leader every `leader_poll_interval` until shutdown
    pub fn spawn_watchdog(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(coordinator.leader_poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.check_leader().await;
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Leader watchdog shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Coordinator counters
    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            passes: self.passes.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            leader_losses: self.leader_losses.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ConsensusCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusCoordinator")
            .field("node_id", &self.node_id)
            .field("stale_threshold", &self.stale_threshold)
            .field("last_election", &*self.last_election.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        membership::ClaimedStatus,
        time::{add_duration, Clock, ManualClock},
    };
    use proptest::prelude::*;

    const STALE: Duration = Duration::from_secs(300);

    fn record(now: DateTime<Utc>, id: &str, epoch: u64, age_secs: i64) -> NodeRecord {
        NodeRecord {
            node_id: NodeId::from(id),
            epoch: Epoch::new(epoch),
            last_seen_at: now - chrono::Duration::seconds(age_secs),
            claimed_status: ClaimedStatus::Alive,
            signature_valid: true,
        }
    }

    #[test]
    fn test_highest_epoch_wins() {
        let now = ManualClock::at_unix(1_700_000_000).now();
        let records = vec![
            record(now, "node-001", 1000, 0),
            record(now, "node-002", 3000, 0),
            record(now, "node-003", 2000, 0),
        ];
        let result = elect(&NodeId::from("node-001"), Epoch::new(1000), &records, now, STALE);

        assert_eq!(result.winner_id, NodeId::from("node-002"));
        assert_eq!(result.winner_epoch, Epoch::new(3000));
        assert_eq!(result.reason, ElectionReason::EpochElection);
    }

    #[test]
    fn test_tie_goes_to_lowest_node_id() {
        let now = ManualClock::at_unix(1_700_000_000).now();
        let records = vec![
            record(now, "zebra-node", 5000, 0),
            record(now, "alpha-node", 5000, 0),
            record(now, "beta-node", 5000, 0),
        ];
        let result = elect(&NodeId::from("zebra-node"), Epoch::new(5000), &records, now, STALE);
        assert_eq!(result.winner_id, NodeId::from("alpha-node"));
    }

    #[test]
    fn test_unsigned_records_never_win() {
        let now = ManualClock::at_unix(1_700_000_000).now();
        let mut forged = record(now, "node-x", 9999, 0);
        forged.signature_valid = false;
        let records = vec![forged, record(now, "node-a", 3, 0)];

        let result = elect(&NodeId::from("node-a"), Epoch::new(3), &records, now, STALE);
        assert_eq!(result.winner_id, NodeId::from("node-a"));
        assert_eq!(result.reason, ElectionReason::NoViablePeers);
    }

    #[test]
    fn test_staleness_boundary() {
        let now = ManualClock::at_unix(1_700_000_000).now();
        let records = vec![record(now, "node-a", 1, 0), record(now, "node-b", 2, 300)];
        let result = elect(&NodeId::from("node-a"), Epoch::new(1), &records, now, STALE);
        assert_eq!(result.winner_id, NodeId::from("node-b"), "exactly at threshold is not stale");

        let later = add_duration(now, Duration::from_secs(1));
        let result = elect(&NodeId::from("node-a"), Epoch::new(1), &records, later, STALE);
        assert_eq!(result.winner_id, NodeId::from("node-a"));
    }

    #[test]
    fn test_election_reason_serialization() {
        assert_eq!(
            serde_json::to_string(&ElectionReason::NoViablePeers).unwrap(),
            "\"no_viable_peers\""
        );
        assert_eq!(
            serde_json::to_string(&ElectionReason::EpochElection).unwrap(),
            "\"epoch_election\""
        );
    }

    #[test]
    fn test_max_viable_epoch_ignores_stale() {
        let now = ManualClock::at_unix(1_700_000_000).now();
        let records = vec![record(now, "node-a", 4, 10), record(now, "node-b", 40, 900)];
        assert_eq!(max_viable_epoch(&records, now, STALE), Some(Epoch::new(4)));
        assert_eq!(max_viable_epoch(&[], now, STALE), None);
    }

    fn arb_records() -> impl Strategy<Value = Vec<(u8, u64, i64, bool)>> {
        prop::collection::vec((0u8..12, 0u64..8, 0i64..600, any::<bool>()), 0..10)
    }

    fn build(now: DateTime<Utc>, raw: &[(u8, u64, i64, bool)]) -> Vec<NodeRecord> {
        let mut seen = std::collections::HashSet::new();
        raw.iter()
            .filter(|(id, ..)| seen.insert(*id))
            .map(|(id, epoch, age, valid)| {
                let mut r = record(now, &format!("node-{id:02}"), *epoch, *age);
                r.signature_valid = *valid;
                r
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_election_is_order_independent(raw in arb_records(), seed in any::<u64>()) {
            let now = ManualClock::at_unix(1_700_000_000).now();
            let records = build(now, &raw);
            let mut shuffled = records.clone();
            // Deterministic rotation stands in for a shuffle
            if !shuffled.is_empty() {
                let k = (seed as usize) % shuffled.len();
                shuffled.rotate_left(k);
                shuffled.reverse();
            }
            let self_id = NodeId::from("node-99");

            let a = elect(&self_id, Epoch::new(0), &records, now, STALE);
            let b = elect(&self_id, Epoch::new(0), &shuffled, now, STALE);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a, elect(&self_id, Epoch::new(0), &records, now, STALE));
        }

        #[test]
        fn prop_winner_is_viable_and_maximal(raw in arb_records()) {
            let now = ManualClock::at_unix(1_700_000_000).now();
            let records = build(now, &raw);
            let self_id = NodeId::from("node-99");
            let result = elect(&self_id, Epoch::new(0), &records, now, STALE);

            if result.winner_id != self_id {
                let winner = records.iter().find(|r| r.node_id == result.winner_id).unwrap();
                prop_assert!(winner.is_viable(now, STALE));
                for r in viable(&records, now, STALE) {
                    prop_assert!(r.epoch < winner.epoch || (r.epoch == winner.epoch && r.node_id >= winner.node_id));
                }
            } else {
                prop_assert!(viable(&records, now, STALE).next().is_none());
            }
        }
    }
}
