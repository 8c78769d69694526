//! # Role State Machine
//!
//! Local Witness/Leader state, the node's own epoch, and its belief about who leads.
//!
//! Transitions are only ever driven by the consensus coordinator after a full election;
//! this module enforces the local invariants (epoch monotonicity, promotion at the current
//! epoch, idempotent transitions) and publishes every change on a watch channel.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::watch;
use tracing::info;

use crate::{
    error::{Error, Result},
    security::ClusterSeal,
    time::SharedClock,
    types::{Epoch, NodeId, Role},
};

/// Snapshot of the local role state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleState {
    /// Current role
    pub role: Role,
    /// This node's epoch; only ever increases
    pub current_epoch: Epoch,
    /// Best-known current leader, possibly this node
    pub leader_id: Option<NodeId>,
    /// Token identifying the current leadership tenure, set only while Leader
    pub lease_token: Option<String>,
    /// Time of the last role transition
    pub changed_at: DateTime<Utc>,
}

/// Published on every role transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleChange {
    /// Role before the transition
    pub from: Role,
    /// Role after the transition
    pub to: Role,
    /// Epoch at the time of the transition
    pub epoch: Epoch,
    /// Leader the node believes in after the transition
    pub leader_id: Option<NodeId>,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Whether a requested transition changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The role changed
    Changed,
    /// Already in the requested role
    Unchanged,
}

/// Owner of the local role state
pub struct RoleStateMachine {
    node_id: NodeId,
    seal: Arc<ClusterSeal>,
    clock: SharedClock,
    state: RwLock<RoleState>,
    changes: watch::Sender<RoleChange>,
}

impl RoleStateMachine {
    /// Start as a Witness at `initial_epoch`
    pub fn new(
        node_id: NodeId,
        initial_epoch: Epoch,
        seal: Arc<ClusterSeal>,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        let state = RoleState {
            role: Role::Witness,
            current_epoch: initial_epoch,
            leader_id: None,
            lease_token: None,
            changed_at: now,
        };
        let (changes, _) = watch::channel(RoleChange {
            from: Role::Witness,
            to: Role::Witness,
            epoch: initial_epoch,
            leader_id: None,
            at: now,
        });
        Self { node_id, seal, clock, state: RwLock::new(state), changes }
    }

    /// This node's identity
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> RoleState {
        self.state.read().clone()
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.state.read().role
    }

    /// This node's epoch
    pub fn current_epoch(&self) -> Epoch {
        self.state.read().current_epoch
    }

    /// Best-known leader
    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.read().leader_id.clone()
    }

    /// Whether this node currently holds leadership
    pub fn is_leader(&self) -> bool {
        self.state.read().role.is_leader()
    }

    /// Observe role transitions
    pub fn subscribe(&self) -> watch::Receiver<RoleChange> {
        self.changes.subscribe()
    }

    /// Raise this node's epoch to `to`; lower or equal values are ignored
    ///
    /// Returns the epoch after the call.
    pub fn advance_epoch(&self, to: Epoch) -> Epoch {
        let mut state = self.state.write();
        if to > state.current_epoch {
            info!(node_id = %self.node_id, from = %state.current_epoch, to = %to, "Advancing epoch");
            state.current_epoch = to;
        }
        state.current_epoch
    }

    /// Record the leader elected elsewhere without changing role
    pub fn observe_leader(&self, leader: NodeId) {
        let mut state = self.state.write();
        if state.leader_id.as_ref() != Some(&leader) {
            info!(node_id = %self.node_id, leader = %leader, "Observed new leader");
            state.leader_id = Some(leader);
        }
    }

    /// Witness to Leader at `winner_epoch`
    ///
    /// # Errors
    /// Returns [`Error::EpochMismatch`] when `winner_epoch` is not this node's current epoch.
    pub fn promote(&self, winner_epoch: Epoch) -> Result<Transition> {
        let now = self.clock.now();
        let mut state = self.state.write();

        if state.current_epoch != winner_epoch {
            return Err(Error::EpochMismatch {
                expected: state.current_epoch.value(),
                actual: winner_epoch.value(),
            });
        }
        if state.role.is_leader() {
            return Ok(Transition::Unchanged);
        }

        state.role = Role::Leader;
        state.leader_id = Some(self.node_id.clone());
        state.lease_token = Some(self.seal.mint_lease_token(&self.node_id, winner_epoch, now));
        state.changed_at = now;
        let change = RoleChange {
            from: Role::Witness,
            to: Role::Leader,
            epoch: winner_epoch,
            leader_id: state.leader_id.clone(),
            at: now,
        };
        drop(state);

        info!(node_id = %self.node_id, epoch = %winner_epoch, "Promoted to leader");
        self.changes.send_replace(change);
        Ok(Transition::Changed)
    }

    /// Leader to Witness, recording `new_leader` as the believed leader
    ///
    /// A no-op on a Witness; use [`observe_leader`](Self::observe_leader) to track leaders there.
    pub fn demote(&self, new_leader: Option<NodeId>, reason: &str) -> Transition {
        let now = self.clock.now();
        let mut state = self.state.write();

        if !state.role.is_leader() {
            return Transition::Unchanged;
        }

        state.role = Role::Witness;
        state.leader_id = new_leader;
        state.lease_token = None;
        state.changed_at = now;
        let change = RoleChange {
            from: Role::Leader,
            to: Role::Witness,
            epoch: state.current_epoch,
            leader_id: state.leader_id.clone(),
            at: now,
        };
        drop(state);

        info!(node_id = %self.node_id, leader = ?change.leader_id, reason, "Demoted to witness");
        self.changes.send_replace(change);
        Transition::Changed
    }
}

impl fmt::Debug for RoleStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RoleStateMachine")
            .field("node_id", &self.node_id)
            .field("role", &state.role)
            .field("current_epoch", &state.current_epoch)
            .field("leader_id", &state.leader_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::time::Duration;

    fn machine(epoch: u64) -> RoleStateMachine {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let seal = Arc::new(ClusterSeal::new("role-seal", Duration::from_secs(300)).unwrap());
        RoleStateMachine::new(NodeId::from("node-a"), Epoch::new(epoch), seal, clock)
    }

    #[test]
    fn test_starts_as_witness() {
        let role = machine(1);
        let state = role.snapshot();
        assert_eq!(state.role, Role::Witness);
        assert_eq!(state.leader_id, None);
        assert_eq!(state.lease_token, None);
    }

    #[test]
    fn test_promote_sets_leader_and_lease() {
        let role = machine(3);
        assert_eq!(role.promote(Epoch::new(3)).unwrap(), Transition::Changed);

        let state = role.snapshot();
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.leader_id, Some(NodeId::from("node-a")));
        assert!(state.lease_token.is_some());
    }

    #[test]
    fn test_promote_is_idempotent() {
        let role = machine(3);
        role.promote(Epoch::new(3)).unwrap();
        let lease = role.snapshot().lease_token;

        assert_eq!(role.promote(Epoch::new(3)).unwrap(), Transition::Unchanged);
        assert_eq!(role.snapshot().lease_token, lease);
    }

    #[test]
    fn test_promote_requires_current_epoch() {
        let role = machine(3);
        let err = role.promote(Epoch::new(2)).unwrap_err();
        assert!(matches!(err, Error::EpochMismatch { expected: 3, actual: 2 }));
        assert!(!role.is_leader());
    }

    #[test]
    fn test_demote_clears_lease() {
        let role = machine(3);
        role.promote(Epoch::new(3)).unwrap();

        assert_eq!(role.demote(Some(NodeId::from("node-b")), "lost election"), Transition::Changed);
        let state = role.snapshot();
        assert_eq!(state.role, Role::Witness);
        assert_eq!(state.leader_id, Some(NodeId::from("node-b")));
        assert_eq!(state.lease_token, None);

        assert_eq!(role.demote(None, "again"), Transition::Unchanged);
        assert_eq!(role.leader_id(), Some(NodeId::from("node-b")));
    }

    #[test]
    fn test_demote_on_witness_changes_nothing() {
        let role = machine(3);
        role.observe_leader(NodeId::from("node-b"));
        let mut rx = role.subscribe();
        let before = role.snapshot();

        assert_eq!(role.demote(Some(NodeId::from("node-c")), "outranked"), Transition::Unchanged);
        assert_eq!(role.snapshot(), before);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_epoch_only_increases() {
        let role = machine(5);
        assert_eq!(role.advance_epoch(Epoch::new(4)), Epoch::new(5));
        assert_eq!(role.advance_epoch(Epoch::new(9)), Epoch::new(9));
        assert_eq!(role.current_epoch(), Epoch::new(9));
    }

    #[test]
    fn test_transitions_are_published() {
        let role = machine(1);
        let mut rx = role.subscribe();

        role.promote(Epoch::new(1)).unwrap();
        assert!(rx.has_changed().unwrap());
        let change = rx.borrow_and_update().clone();
        assert_eq!((change.from, change.to), (Role::Witness, Role::Leader));

        role.promote(Epoch::new(1)).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_new_tenure_new_lease() {
        let role = machine(1);
        role.promote(Epoch::new(1)).unwrap();
        let first = role.snapshot().lease_token;
        role.demote(None, "partition");
        role.advance_epoch(Epoch::new(2));
        role.promote(Epoch::new(2)).unwrap();

        assert_ne!(role.snapshot().lease_token, first);
    }
}
