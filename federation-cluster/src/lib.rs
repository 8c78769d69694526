//! # Federation Cluster
//!
//! Leader election, signed heartbeats and leadership handover for a small federation of
//! independent runtime nodes.
//!
//! Every node broadcasts HMAC-signed heartbeats carrying its epoch. Each node elects the
//! highest-epoch node among the signed, non-stale heartbeats it has seen, with ties going
//! to the lowest node id. A node that wins while the previous leader is still reachable
//! announces a handover and waits a bounded window for the old leader to step down. Only
//! the node holding the Leader role passes the privileged command gate.
//!
//! This is not a quorum protocol. Under a partition each side can elect its own leader;
//! overlap during a handover is bounded by the handover window but not eliminated. Forged
//! and replayed messages are always rejected.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

/// Federation configuration
pub mod config;

/// Peer transport and fan-out
pub mod communication;

/// Election and the consensus coordinator
pub mod consensus;

/// Federation error types and handling
pub mod error;

/// Leader-only command authorization
pub mod gate;

/// Leadership handover
pub mod ha;

/// Periodic heartbeat broadcasting
pub mod heartbeat;

/// Peer view built from verified heartbeats
pub mod membership;

/// Message definitions and wire bodies
pub mod messages;

/// Local Witness/Leader state
pub mod role;

/// Cluster seal signing and verification
pub mod security;

/// Wall-clock abstraction
pub mod time;

/// Core types used across the federation
pub mod types;

/// In-process transport for multi-node tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export commonly used types for convenience
pub use crate::{
    communication::{HttpTransport, PeerEndpoint, PeerTransport},
    config::{ApiConfig, FederationConfig, FederationConfigBuilder, PeerConfig, TimingConfig},
    consensus::{elect, ElectionReason, ElectionResult, PassOutcome, PassTrigger},
    error::{Error, Result},
    gate::{Authorization, CommandAction, CommandGate, PrivilegedCommand},
    ha::{HandoverOutcome, HandoverRecord, HandoverTransaction},
    membership::{NodeRecord, PeerView, RejectionReason},
    messages::{
        FederationMessage, HandoverNotice, HeartbeatMessage, HeartbeatRequest, HeartbeatResponse,
        NoticeKind, NoticeRequest, NoticeResponse,
    },
    role::{RoleChange, RoleState},
    security::ClusterSeal,
    time::{Clock, ManualClock, SharedClock, SystemClock},
    types::{Epoch, NodeId, Role},
};

use crate::{
    consensus::{ConsensusCoordinator, ConsensusStats, CoordinatorTiming},
    gate::GateStats,
    ha::HandoverOrchestrator,
    heartbeat::{HeartbeatBroadcaster, HeartbeatStats},
    membership::{IngestOutcome, PeerViewStats},
    role::RoleStateMachine,
    time::unix_seconds,
};

/// A peer as shown on the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// The underlying record
    #[serde(flatten)]
    pub record: NodeRecord,
    /// Whether the record is past the stale threshold
    pub stale: bool,
    /// Seconds since the record was refreshed
    pub age_seconds: u64,
}

/// Handover state for the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverStatus {
    /// Handover currently waiting for an acknowledgment
    pub pending: Option<HandoverTransaction>,
    /// Recently completed handovers, oldest first
    pub history: Vec<HandoverRecord>,
}

/// All counters of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationStats {
    /// Inbound message verification
    pub ingress: PeerViewStats,
    /// Outbound heartbeats
    pub heartbeat: HeartbeatStats,
    /// Privileged command decisions
    pub gate: GateStats,
    /// Consensus passes
    pub consensus: ConsensusStats,
}

/// Read-only snapshot of a node's federation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationStatus {
    /// This node
    pub node_id: NodeId,
    /// Current role
    pub role: Role,
    /// This node's epoch
    pub current_epoch: Epoch,
    /// Best-known leader
    pub leader_id: Option<NodeId>,
    /// Whether a lease token is held
    pub has_lease: bool,
    /// When the role last changed
    pub role_changed_at: DateTime<Utc>,
    /// Most recent election
    pub last_election: Option<ElectionResult>,
    /// Peer records, sorted by node id
    pub peers: Vec<PeerStatus>,
    /// Counters
    pub stats: FederationStats,
    /// Handover state
    pub handover: HandoverStatus,
}

/// One federation node with all of its components wired together
pub struct FederationNode {
    config: FederationConfig,
    node_id: NodeId,
    clock: SharedClock,
    peer_view: Arc<PeerView>,
    role: Arc<RoleStateMachine>,
    broadcaster: Arc<HeartbeatBroadcaster>,
    handover: Arc<HandoverOrchestrator>,
    coordinator: Arc<ConsensusCoordinator>,
    gate: Arc<CommandGate>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FederationNode {
    /// Create a node on the system clock
    ///
    /// # Errors
    /// Fails if the configuration is invalid or the seal is empty.
    pub fn new(
        config: FederationConfig,
        cluster_seal: &[u8],
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        Self::with_clock(config, cluster_seal, transport, Arc::new(SystemClock))
    }

    /// Create a node on an explicit clock
    ///
    /// The node boots as a Witness at an epoch equal to the boot time in Unix seconds, so
    /// epochs keep increasing across restarts without persisted state.
    ///
    /// # Errors
    /// Fails if the configuration is invalid or the seal is empty.
    pub fn with_clock(
        config: FederationConfig,
        cluster_seal: &[u8],
        transport: Arc<dyn PeerTransport>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate_config()?;

        let timing = config.timing.clone();
        let node_id = config.node_id.clone();
        let peers = config.peer_endpoints();
        let seal = Arc::new(ClusterSeal::new(cluster_seal, timing.freshness_window())?);

        let peer_view =
            Arc::new(PeerView::new(node_id.clone(), Arc::clone(&seal), Arc::clone(&clock)));
        let boot_epoch = Epoch::new(unix_seconds(clock.now()));
        let role = Arc::new(RoleStateMachine::new(
            node_id.clone(),
            boot_epoch,
            Arc::clone(&seal),
            Arc::clone(&clock),
        ));
        let broadcaster = Arc::new(HeartbeatBroadcaster::new(
            Arc::clone(&seal),
            Arc::clone(&clock),
            Arc::clone(&role),
            Arc::clone(&peer_view),
            Arc::clone(&transport),
            peers.clone(),
            timing.heartbeat_interval(),
            timing.send_timeout(),
        ));
        let handover = Arc::new(HandoverOrchestrator::new(
            node_id.clone(),
            Arc::clone(&seal),
            Arc::clone(&clock),
            transport,
            peers,
            timing.handover_window(),
            timing.send_timeout(),
        ));
        let coordinator = Arc::new(ConsensusCoordinator::new(
            Arc::clone(&clock),
            Arc::clone(&peer_view),
            Arc::clone(&role),
            Arc::clone(&broadcaster),
            Arc::clone(&handover),
            CoordinatorTiming {
                stale_threshold: timing.stale_threshold(),
                consensus_interval: timing.consensus_interval(),
                leader_poll_interval: timing.leader_poll_interval(),
                first_pass_delay: timing.heartbeat_interval(),
            },
        ));
        let gate = Arc::new(CommandGate::new(Arc::clone(&role)));
        let (shutdown_tx, _) = watch::channel(false);

        info!(node_id = %node_id, epoch = %boot_epoch, peers = config.peers.len(), "Created federation node");

        Ok(Self {
            config,
            node_id,
            clock,
            peer_view,
            role,
            broadcaster,
            handover,
            coordinator,
            gate,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the broadcaster, the periodic consensus pass and the leader watchdog
    ///
    /// Calling `start` on a running node does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.broadcaster.spawn(self.shutdown_tx.subscribe()));
        tasks.push(self.coordinator.spawn_interval(self.shutdown_tx.subscribe()));
        tasks.push(self.coordinator.spawn_watchdog(self.shutdown_tx.subscribe()));
        info!(node_id = %self.node_id, "Federation node started");
    }

    /// Signal every task to stop and wait for them
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node_id = %self.node_id, error = %e, "Federation task ended abnormally");
            }
        }
        info!(node_id = %self.node_id, "Federation node stopped");
    }

    /// Handle `POST /federation/heartbeat`
    pub fn receive_heartbeat(&self, request: &HeartbeatRequest) -> HeartbeatResponse {
        let received_at = self.clock.now();
        let age_seconds = received_at.timestamp() as f64 - request.sent_at as f64;

        let valid = if request.cluster_root != self.config.cluster_root {
            debug!(node_id = %request.node_id, cluster_root = %request.cluster_root, "Foreign cluster root");
            self.peer_view.record_rejection(RejectionReason::WrongCluster);
            false
        } else {
            match request.to_message() {
                Ok(heartbeat) => self.ingest_heartbeat(&heartbeat),
                Err(_) => {
                    self.peer_view.record_rejection(RejectionReason::Malformed);
                    false
                },
            }
        };

        HeartbeatResponse { ok: true, valid, age_seconds, received_at }
    }

    /// Handle `POST /federation/handover/{intent,ack}`
    pub fn receive_notice(&self, expected: NoticeKind, request: &NoticeRequest) -> NoticeResponse {
        let received_at = self.clock.now();

        let valid = if request.cluster_root != self.config.cluster_root {
            self.peer_view.record_rejection(RejectionReason::WrongCluster);
            false
        } else if request.notice.kind != expected {
            self.peer_view.record_rejection(RejectionReason::Malformed);
            false
        } else {
            self.accept_notice(&request.notice)
        };

        NoticeResponse { ok: true, valid, received_at }
    }

    /// Deliver a typed message that already passed any transport-level checks
    pub fn receive(&self, message: &FederationMessage) -> bool {
        match message {
            FederationMessage::Heartbeat(hb) => self.ingest_heartbeat(hb),
            FederationMessage::HandoverIntent(notice) if notice.kind == NoticeKind::Intent => {
                self.accept_notice(notice)
            },
            FederationMessage::HandoverAck(notice) if notice.kind == NoticeKind::Ack => {
                self.accept_notice(notice)
            },
            _ => {
                self.peer_view.record_rejection(RejectionReason::Malformed);
                false
            },
        }
    }

    /// Answer for a heartbeat body that could not be decoded at all
    pub fn reject_malformed_heartbeat(&self) -> HeartbeatResponse {
        self.peer_view.record_rejection(RejectionReason::Malformed);
        HeartbeatResponse { ok: true, valid: false, age_seconds: 0.0, received_at: self.clock.now() }
    }

    /// Answer for a notice body that could not be decoded at all
    pub fn reject_malformed_notice(&self) -> NoticeResponse {
        self.peer_view.record_rejection(RejectionReason::Malformed);
        NoticeResponse { ok: true, valid: false, received_at: self.clock.now() }
    }

    fn ingest_heartbeat(&self, heartbeat: &HeartbeatMessage) -> bool {
        let outcome = self.peer_view.ingest(heartbeat);
        if let IngestOutcome::Accepted { record, .. } = &outcome {
            // A leader that sees a higher epoch re-elects now instead of at its next interval
            if self.role.is_leader() && record.epoch > self.role.current_epoch() {
                info!(peer = %record.node_id, epoch = %record.epoch, "Peer outranks the local leader");
                let coordinator = Arc::clone(&self.coordinator);
                tokio::spawn(async move {
                    if let Err(e) = coordinator.run_pass(PassTrigger::HigherEpochSeen).await {
                        warn!(error = %e, "Consensus pass after higher epoch failed");
                    }
                });
            }
        }
        outcome.is_accepted()
    }

    fn accept_notice(&self, notice: &HandoverNotice) -> bool {
        if !matches!(self.peer_view.ingest_notice(notice), IngestOutcome::Accepted { .. }) {
            return false;
        }

        match notice.kind {
            NoticeKind::Intent => {
                info!(
                    from = %notice.from,
                    old_leader = %notice.old_leader_id,
                    epoch = %notice.epoch,
                    "Handover intent received"
                );
                let coordinator = Arc::clone(&self.coordinator);
                let handover = Arc::clone(&self.handover);
                let role = Arc::clone(&self.role);
                let notice = notice.clone();
                tokio::spawn(async move {
                    match coordinator.run_pass(PassTrigger::HandoverIntent).await {
                        // Already stepped down before the intent arrived, so confirm it here
                        Ok(PassOutcome::Following { leader, demoted: false })
                            if leader == notice.from && &notice.old_leader_id == role.node_id() =>
                        {
                            handover.send_ack(&leader, role.current_epoch()).await;
                        },
                        Ok(_) => {},
                        Err(e) => warn!(error = %e, "Consensus pass after handover intent failed"),
                    }
                });
            },
            NoticeKind::Ack => {
                if self.handover.acknowledge(notice) {
                    info!(from = %notice.from, "Handover acknowledged by old leader");
                }
            },
        }
        true
    }

    /// Read-only snapshot for dashboards
    pub fn status(&self) -> FederationStatus {
        let now = self.clock.now();
        let state = self.role.snapshot();
        let stale_threshold = self.config.timing.stale_threshold();
        let peers = self
            .peer_view
            .peers()
            .into_iter()
            .map(|record| PeerStatus {
                stale: record.is_stale(now, stale_threshold),
                age_seconds: record.age(now).as_secs(),
                record,
            })
            .collect();

        FederationStatus {
            node_id: self.node_id.clone(),
            role: state.role,
            current_epoch: state.current_epoch,
            leader_id: state.leader_id,
            has_lease: state.lease_token.is_some(),
            role_changed_at: state.changed_at,
            last_election: self.coordinator.last_election(),
            peers,
            stats: FederationStats {
                ingress: self.peer_view.stats(),
                heartbeat: self.broadcaster.stats(),
                gate: self.gate.stats(),
                consensus: self.coordinator.stats(),
            },
            handover: HandoverStatus {
                pending: self.handover.pending(),
                history: self.handover.history(),
            },
        }
    }

    /// This node's identity
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The configuration the node was built from
    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    /// Lease token of the current leadership tenure
    pub fn lease_token(&self) -> Option<String> {
        self.role.snapshot().lease_token
    }

    /// Observe role transitions
    pub fn subscribe(&self) -> watch::Receiver<RoleChange> {
        self.role.subscribe()
    }

    /// Privileged command gate
    pub fn gate(&self) -> &Arc<CommandGate> {
        &self.gate
    }

    /// Role state machine
    pub fn role(&self) -> &Arc<RoleStateMachine> {
        &self.role
    }

    /// Peer view
    pub fn peer_view(&self) -> &Arc<PeerView> {
        &self.peer_view
    }

    /// Consensus coordinator
    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    /// Heartbeat broadcaster
    pub fn broadcaster(&self) -> &Arc<HeartbeatBroadcaster> {
        &self.broadcaster
    }

    /// Handover orchestrator
    pub fn handover(&self) -> &Arc<HandoverOrchestrator> {
        &self.handover
    }
}

impl fmt::Debug for FederationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederationNode")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .field("peer_view", &self.peer_view)
            .finish()
    }
}
