//! # Test Utilities Module
//!
//! In-process wiring of several federation nodes for tests.
//!
//! [`MockTransport`] delivers messages by calling the target node directly and can take
//! nodes down or cut individual links. [`TestFederation`] builds a set of nodes sharing one
//! transport and one [`ManualClock`], so staleness is controlled by advancing the clock
//! rather than by waiting.
//!
//! Only available in tests or with the `test-utils` feature.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use crate::{
    communication::{PeerEndpoint, PeerTransport},
    config::{FederationConfig, TimingConfig},
    error::{Error, Result},
    messages::FederationMessage,
    time::ManualClock,
    types::NodeId,
    FederationNode,
};

/// Cluster seal shared by every node a [`TestFederation`] builds
pub const TEST_SEAL: &[u8] = b"federation-test-seal";

/// Cluster root shared by every node a [`TestFederation`] builds
pub const TEST_CLUSTER_ROOT: &str = "test-federation";

/// Default Unix time the shared clock starts at
pub const TEST_EPOCH_START: i64 = 1_700_000_000;

/// Transport that hands messages straight to registered in-process nodes
#[derive(Debug, Default)]
pub struct MockTransport {
    nodes: RwLock<HashMap<NodeId, Weak<FederationNode>>>,
    down: RwLock<HashSet<NodeId>>,
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MockTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable through this transport
    pub fn register(&self, node: &Arc<FederationNode>) {
        self.nodes.write().insert(node.node_id().clone(), Arc::downgrade(node));
    }

    /// Take a node off the network in both directions
    pub fn take_down(&self, node_id: &NodeId) {
        self.down.write().insert(node_id.clone());
    }

    /// Put a node back on the network
    pub fn bring_up(&self, node_id: &NodeId) {
        self.down.write().remove(node_id);
    }

    /// Drop messages between `a` and `b` in both directions
    pub fn cut_link(&self, a: &NodeId, b: &NodeId) {
        let mut cut = self.cut.write();
        cut.insert((a.clone(), b.clone()));
        cut.insert((b.clone(), a.clone()));
    }

    /// Restore every cut link
    pub fn heal(&self) {
        self.cut.write().clear();
    }

    /// Messages handed to a node
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages refused because of a down node or a cut link
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        let down = self.down.read();
        !down.contains(from)
            && !down.contains(to)
            && !self.cut.read().contains(&(from.clone(), to.clone()))
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn deliver(&self, peer: &PeerEndpoint, message: &FederationMessage) -> Result<()> {
        if !self.reachable(message.sender(), &peer.node_id) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::node_unavailable(&peer.node_id));
        }

        let target = self.nodes.read().get(&peer.node_id).and_then(Weak::upgrade);
        let Some(target) = target else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::node_unavailable(&peer.node_id));
        };

        // Like the HTTP endpoint, the receiver answers even when it rejects the message
        target.receive(message);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Several fully meshed nodes on one [`MockTransport`] and one [`ManualClock`]
#[derive(Debug)]
pub struct TestFederation {
    /// Shared transport
    pub transport: Arc<MockTransport>,
    /// Shared clock
    pub clock: Arc<ManualClock>,
    /// Nodes in the order their ids were given
    pub nodes: Vec<Arc<FederationNode>>,
}

impl TestFederation {
    /// Build a fully meshed federation with default timing
    pub fn new(ids: &[&str]) -> Result<Self> {
        Self::with_timing(ids, TimingConfig::default())
    }

    /// Build a fully meshed federation with the given timing
    pub fn with_timing(ids: &[&str], timing: TimingConfig) -> Result<Self> {
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::at_unix(TEST_EPOCH_START));

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let mut builder = FederationConfig::builder()
                .node_id(*id)
                .cluster_root(TEST_CLUSTER_ROOT)
                .timing(timing.clone());
            for peer in ids.iter().filter(|p| *p != id) {
                builder = builder.add_peer(*peer, format!("http://{peer}.test:8787"));
            }
            let node = Arc::new(FederationNode::with_clock(
                builder.build()?,
                TEST_SEAL,
                Arc::clone(&transport) as Arc<dyn PeerTransport>,
                Arc::clone(&clock) as Arc<dyn crate::time::Clock>,
            )?);
            transport.register(&node);
            nodes.push(node);
        }

        Ok(Self { transport, clock, nodes })
    }

    /// Look a node up by id
    pub fn node(&self, id: &str) -> Arc<FederationNode> {
        self.nodes
            .iter()
            .find(|n| n.node_id().as_str() == id)
            .cloned()
            .unwrap_or_else(|| panic!("no test node {id}"))
    }

    /// Advance the shared clock
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// One heartbeat round from every node
    pub async fn heartbeat_round(&self) {
        for node in &self.nodes {
            node.broadcaster().broadcast_now().await;
        }
    }

    /// Nodes currently holding the Leader role
    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.role().is_leader())
            .map(|n| n.node_id().clone())
            .collect()
    }
}
