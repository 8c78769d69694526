//! # Heartbeat Broadcaster
//!
//! Periodically announces `(node_id, current_epoch)` to every configured peer.
//!
//! Each round signs a fresh heartbeat and fans it out concurrently. The time of the last
//! successful round is written back to the peer view, where it becomes the `last_seen_at`
//! of the node's own record and feeds the self-partition safeguard.

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
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    communication::{broadcast, BroadcastReport, PeerEndpoint, PeerTransport},
    membership::PeerView,
    messages::{FederationMessage, HeartbeatMessage},
    role::RoleStateMachine,
    security::ClusterSeal,
    time::{unix_seconds, SharedClock},
};

/// Outbound heartbeat counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStats {
    /// Broadcast rounds started
    pub rounds: u64,
    /// Rounds in which no peer took the heartbeat
    pub failed_rounds: u64,
    /// Individual deliveries that succeeded
    pub sent: u64,
    /// Individual deliveries that failed
    pub failed_sends: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rounds: AtomicU64,
    failed_rounds: AtomicU64,
    sent: AtomicU64,
    failed_sends: AtomicU64,
}

/// Signs and sends heartbeats
pub struct HeartbeatBroadcaster {
    seal: Arc<ClusterSeal>,
    clock: SharedClock,
    role: Arc<RoleStateMachine>,
    peer_view: Arc<PeerView>,
    transport: Arc<dyn PeerTransport>,
    peers: Vec<PeerEndpoint>,
    heartbeat_interval: Duration,
    send_timeout: Duration,
    counters: Counters,
}

impl HeartbeatBroadcaster {
    /// Create a broadcaster for the node owning `role`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seal: Arc<ClusterSeal>,
        clock: SharedClock,
        role: Arc<RoleStateMachine>,
        peer_view: Arc<PeerView>,
        transport: Arc<dyn PeerTransport>,
        peers: Vec<PeerEndpoint>,
        heartbeat_interval: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            seal,
            clock,
            role,
            peer_view,
            transport,
            peers,
            heartbeat_interval,
            send_timeout,
            counters: Counters::default(),
        }
    }

    /// Sign a heartbeat for the current epoch at the current time
    pub fn build_heartbeat(&self) -> HeartbeatMessage {
        HeartbeatMessage::signed(
            &self.seal,
            self.role.node_id().clone(),
            self.role.current_epoch(),
            unix_seconds(self.clock.now()),
        )
    }

    /// Run one broadcast round immediately
    pub async fn broadcast_now(&self) -> BroadcastReport {
        let started_at = self.clock.now();
        let heartbeat = self.build_heartbeat();
        let epoch = heartbeat.epoch;
        let message = FederationMessage::Heartbeat(heartbeat);

        let report =
            broadcast(self.transport.as_ref(), &self.peers, &message, self.send_timeout).await;

        self.counters.rounds.fetch_add(1, Ordering::Relaxed);
        self.counters.sent.fetch_add(report.delivered.len() as u64, Ordering::Relaxed);
        self.counters.failed_sends.fetch_add(report.failed.len() as u64, Ordering::Relaxed);

        if report.is_success() {
            self.peer_view.mark_self_seen(started_at);
            debug!(
                node_id = %self.role.node_id(),
                %epoch,
                delivered = report.delivered.len(),
                "Heartbeat round complete"
            );
        } else {
            self.counters.failed_rounds.fetch_add(1, Ordering::Relaxed);
            warn!(
                node_id = %self.role.node_id(),
                %epoch,
                failed = report.failed.len(),
                "Heartbeat reached no peer"
            );
        }
        report
    }

    /// Run rounds every `heartbeat_interval` until shutdown
    ///
    /// The first round fires immediately.
    pub fn spawn(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(broadcaster.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        broadcaster.broadcast_now().await;
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Heartbeat broadcaster shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Outbound counters
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            rounds: self.counters.rounds.load(Ordering::Relaxed),
            failed_rounds: self.counters.failed_rounds.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed_sends: self.counters.failed_sends.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for HeartbeatBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatBroadcaster")
            .field("node_id", self.role.node_id())
            .field("peers", &self.peers.len())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}
