//! # Handover Orchestration
//!
//! Publishes handover intents, waits for acknowledgments, and sends acknowledgments when
//! this node is the one stepping down.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, info, instrument, warn};

use super::{HandoverError, HandoverOutcome, HandoverResult};
use crate::{
    communication::{broadcast, BroadcastReport, PeerEndpoint, PeerTransport},
    messages::{FederationMessage, HandoverNotice, NoticeKind},
    security::ClusterSeal,
    time::{add_duration, unix_seconds, SharedClock},
    types::{Epoch, NodeId},
};

/// Completed handovers kept for observability
pub const HISTORY_LIMIT: usize = 32;

/// One attempt to take leadership over from a reachable old leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverTransaction {
    /// Transaction identifier
    pub id: String,
    /// Leader being replaced
    pub old_leader_id: NodeId,
    /// This node
    pub new_leader_id: NodeId,
    /// Epoch the new leader takes over at
    pub epoch: Epoch,
    /// When the intent went out
    pub initiated_at: DateTime<Utc>,
    /// When the orchestrator stops waiting
    pub ack_deadline: DateTime<Utc>,
    /// Whether the old leader acknowledged
    pub ack_received: bool,
}

impl HandoverTransaction {
    fn generate_id() -> String {
        format!("handover-{}", uuid::Uuid::new_v4())
    }
}

/// A finished handover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverRecord {
    /// The transaction as it stood when it finished
    pub transaction: HandoverTransaction,
    /// How it ended
    pub outcome: HandoverOutcome,
    /// When it finished
    pub completed_at: DateTime<Utc>,
}

struct PendingHandover {
    transaction: HandoverTransaction,
    ack_tx: Option<oneshot::Sender<()>>,
}

/// Drives handovers for the local node
pub struct HandoverOrchestrator {
    node_id: NodeId,
    seal: Arc<ClusterSeal>,
    clock: SharedClock,
    transport: Arc<dyn PeerTransport>,
    peers: Vec<PeerEndpoint>,
    handover_window: Duration,
    send_timeout: Duration,
    pending: Mutex<Option<PendingHandover>>,
    history: RwLock<VecDeque<HandoverRecord>>,
}

impl HandoverOrchestrator {
    /// Create an orchestrator for `node_id`
    pub fn new(
        node_id: NodeId,
        seal: Arc<ClusterSeal>,
        clock: SharedClock,
        transport: Arc<dyn PeerTransport>,
        peers: Vec<PeerEndpoint>,
        handover_window: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            seal,
            clock,
            transport,
            peers,
            handover_window,
            send_timeout,
            pending: Mutex::new(None),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Announce the takeover from `old_leader` and wait for its acknowledgment
    ///
    /// Always returns once the window has elapsed; the caller proceeds either way.
    ///
    /// # Errors
    /// Fails if a handover is already running or `old_leader` is this node.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run(&self, old_leader: NodeId, epoch: Epoch) -> HandoverResult<HandoverRecord> {
        if old_leader == self.node_id {
            return Err(HandoverError::SelfHandover { node_id: old_leader });
        }

        let initiated_at = self.clock.now();
        let transaction = HandoverTransaction {
            id: HandoverTransaction::generate_id(),
            old_leader_id: old_leader.clone(),
            new_leader_id: self.node_id.clone(),
            epoch,
            initiated_at,
            ack_deadline: add_duration(initiated_at, self.handover_window),
            ack_received: false,
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if let Some(running) = pending.as_ref() {
                return Err(HandoverError::AlreadyInProgress {
                    old_leader_id: running.transaction.old_leader_id.clone(),
                });
            }
            *pending = Some(PendingHandover { transaction: transaction.clone(), ack_tx: Some(ack_tx) });
        }

        info!(handover_id = %transaction.id, old_leader = %old_leader, %epoch, "Starting handover");

        let intent = HandoverNotice::signed(
            &self.seal,
            NoticeKind::Intent,
            self.node_id.clone(),
            old_leader.clone(),
            self.node_id.clone(),
            epoch,
            unix_seconds(initiated_at),
        );
        let report = broadcast(
            self.transport.as_ref(),
            &self.peers,
            &FederationMessage::HandoverIntent(intent),
            self.send_timeout,
        )
        .await;
        debug!(delivered = report.delivered.len(), failed = report.failed.len(), "Intent published");

        let outcome = match timeout(self.handover_window, ack_rx).await {
            Ok(Ok(())) => HandoverOutcome::Acknowledged,
            Ok(Err(_)) | Err(_) => HandoverOutcome::DeadlineElapsed,
        };

        let mut transaction = self
            .pending
            .lock()
            .take()
            .map(|p| p.transaction)
            .unwrap_or(transaction);
        transaction.ack_received = outcome == HandoverOutcome::Acknowledged;

        match outcome {
            HandoverOutcome::Acknowledged => {
                info!(handover_id = %transaction.id, old_leader = %old_leader, "Handover acknowledged")
            },
            HandoverOutcome::DeadlineElapsed => warn!(
                handover_id = %transaction.id,
                old_leader = %old_leader,
                window = ?self.handover_window,
                "Handover window elapsed without acknowledgment"
            ),
        }

        let record = HandoverRecord { transaction, outcome, completed_at: self.clock.now() };
        self.push_history(record.clone());
        Ok(record)
    }

    /// Deliver an acknowledgment to the running handover
    ///
    /// Returns `true` when the notice matched the pending transaction. The notice must
    /// already have passed verification.
    pub fn acknowledge(&self, notice: &HandoverNotice) -> bool {
        if notice.kind != NoticeKind::Ack || notice.new_leader_id != self.node_id {
            return false;
        }

        let mut pending = self.pending.lock();
        let Some(running) = pending.as_mut() else {
            debug!(from = %notice.from, "Acknowledgment with no handover pending");
            return false;
        };
        if running.transaction.old_leader_id != notice.from {
            debug!(
                from = %notice.from,
                expected = %running.transaction.old_leader_id,
                "Acknowledgment from unexpected node"
            );
            return false;
        }

        running.transaction.ack_received = true;
        if let Some(tx) = running.ack_tx.take() {
            let _ = tx.send(());
        }
        true
    }

    /// Tell `new_leader` that this node stepped down
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn send_ack(&self, new_leader: &NodeId, epoch: Epoch) -> BroadcastReport {
        let Some(peer) = self.peers.iter().find(|p| &p.node_id == new_leader) else {
            warn!(new_leader = %new_leader, "New leader is not a configured peer, acknowledgment not sent");
            return BroadcastReport::default();
        };

        let ack = HandoverNotice::signed(
            &self.seal,
            NoticeKind::Ack,
            self.node_id.clone(),
            self.node_id.clone(),
            new_leader.clone(),
            epoch,
            unix_seconds(self.clock.now()),
        );
        broadcast(
            self.transport.as_ref(),
            std::slice::from_ref(peer),
            &FederationMessage::HandoverAck(ack),
            self.send_timeout,
        )
        .await
    }

    /// The handover currently waiting, if any
    pub fn pending(&self) -> Option<HandoverTransaction> {
        self.pending.lock().as_ref().map(|p| p.transaction.clone())
    }

    /// Completed handovers, oldest first
    pub fn history(&self) -> Vec<HandoverRecord> {
        self.history.read().iter().cloned().collect()
    }

    fn push_history(&self, record: HandoverRecord) {
        let mut history = self.history.write();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
    }
}

impl fmt::Debug for HandoverOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoverOrchestrator")
            .field("node_id", &self.node_id)
            .field("handover_window", &self.handover_window)
            .field("pending", &self.pending.lock().is_some())
            .finish()
    }
}
