//! # Privileged Command Gate
//!
//! Decides whether this node may execute an orchestration command. The decision reads only
//! local role state: a node holding the Leader role may act, every other node is refused.
//! The gate never runs an election and never blocks.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    role::RoleStateMachine,
    types::NodeId,
};

/// Orchestration actions reserved for the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Roll out a deployment
    Deploy,
    /// Start a container
    ContainerStart,
    /// Stop a container
    ContainerStop,
    /// Restart a container
    ContainerRestart,
    /// Create a network
    NetworkCreate,
}

impl CommandAction {
    /// Every action, in route order
    pub const ALL: [Self; 5] = [
        Self::Deploy,
        Self::ContainerStart,
        Self::ContainerStop,
        Self::ContainerRestart,
        Self::NetworkCreate,
    ];

    /// Path segment naming the action
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::ContainerStart => "container_start",
            Self::ContainerStop => "container_stop",
            Self::ContainerRestart => "container_restart",
            Self::NetworkCreate => "network_create",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s || a.as_str().replace('_', "-") == s)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

/// A command awaiting authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegedCommand {
    /// What to do
    pub action: CommandAction,
    /// What to do it to (deployment name, container id, network name)
    pub target: String,
}

impl PrivilegedCommand {
    /// Create a command
    pub fn new(action: CommandAction, target: impl Into<String>) -> Self {
        Self { action, target: target.into() }
    }
}

/// The gate's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Whether the command may run here
    pub allow: bool,
    /// Human-readable explanation
    pub reason: String,
    /// Best-known leader, so callers can redirect
    pub leader_id: Option<NodeId>,
}

/// Gate allow/deny counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    /// Commands allowed
    pub allowed: u64,
    /// Commands refused
    pub denied: u64,
}

/// Leader-only authorization gate
pub struct CommandGate {
    role: Arc<RoleStateMachine>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl CommandGate {
    /// Create a gate reading `role`
    pub fn new(role: Arc<RoleStateMachine>) -> Self {
        Self { role, allowed: AtomicU64::new(0), denied: AtomicU64::new(0) }
    }

    /// Decide whether `command` may execute on this node
    pub fn authorize(&self, command: &PrivilegedCommand) -> Authorization {
        let state = self.role.snapshot();

        if state.role.is_leader() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            debug!(action = %command.action, target = %command.target, "Command authorized");
            Authorization {
                allow: true,
                reason: format!("{} is the leader at epoch {}", self.role.node_id(), state.current_epoch),
                leader_id: state.leader_id,
            }
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                action = %command.action,
                target = %command.target,
                leader = ?state.leader_id,
                "Command refused on non-leader"
            );
            let reason = match &state.leader_id {
                Some(leader) => format!("not the leader; current leader is {leader}"),
                None => "not the leader; no leader known".to_string(),
            };
            Authorization { allow: false, reason, leader_id: state.leader_id }
        }
    }

    /// Authorize or fail with [`Error::NotLeader`]
    pub fn require_leader(&self, command: &PrivilegedCommand) -> Result<Authorization> {
        let auth = self.authorize(command);
        if auth.allow {
            Ok(auth)
        } else {
            Err(Error::NotLeader { leader_id: auth.leader_id.map(|id| id.to_string()) })
        }
    }

    /// Allow/deny counters
    pub fn stats(&self) -> GateStats {
        GateStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CommandGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGate").field("stats", &self.stats()).finish()
    }
}
