//! # Federation Configuration
//!
//! This module provides configuration for a federation node: identity, peers, timing and
//! the HTTP surface. The cluster seal is deliberately absent; it is supplied through the
//! environment and never serialized.

use crate::{
    communication::PeerEndpoint,
    error::{Error, Result},
    types::NodeId,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use validator::Validate;

/// Complete configuration for one federation node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FederationConfig {
    /// Stable identity of this node
    pub node_id: NodeId,

    /// Cluster this node belongs to; heartbeats naming another root are rejected
    #[validate(length(min = 1, max = 256))]
    pub cluster_root: String,

    /// Statically configured peers
    pub peers: Vec<PeerConfig>,

    /// Protocol timing
    pub timing: TimingConfig,

    /// HTTP surface
    pub api: ApiConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(""),
            cluster_root: String::new(),
            peers: Vec::new(),
            timing: TimingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> FederationConfigBuilder {
        FederationConfigBuilder::default()
    }

    /// Peers as transport endpoints
    #[must_use]
    pub fn peer_endpoints(&self) -> Vec<PeerEndpoint> {
        self.peers
            .iter()
            .map(|p| PeerEndpoint::new(p.node_id.clone(), p.endpoint.clone()))
            .collect()
    }

    /// Validate the configuration
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::Configuration(format!("Configuration validation failed: {e}")))?;
        self.timing
            .validate()
            .map_err(|e| Error::Configuration(format!("Timing validation failed: {e}")))?;

        if self.node_id.is_empty() {
            return Err(Error::Configuration("Node ID is required".to_string()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            peer.validate()
                .map_err(|e| Error::Configuration(format!("Peer {}: {e}", peer.node_id)))?;
            if peer.node_id.is_empty() {
                return Err(Error::Configuration("Peer node ID cannot be empty".to_string()));
            }
            if peer.node_id == self.node_id {
                return Err(Error::Configuration(format!(
                    "Node {} lists itself as a peer",
                    self.node_id
                )));
            }
            if !seen.insert(&peer.node_id) {
                return Err(Error::Configuration(format!("Duplicate peer {}", peer.node_id)));
            }
            if !(peer.endpoint.starts_with("http://") || peer.endpoint.starts_with("https://")) {
                return Err(Error::Configuration(format!(
                    "Peer {} endpoint must be an http(s) URL",
                    peer.node_id
                )));
            }
        }

        let t = &self.timing;
        if t.heartbeat_interval_secs >= t.stale_threshold_secs {
            return Err(Error::Configuration(
                "Heartbeat interval must be shorter than the stale threshold".to_string(),
            ));
        }
        if t.leader_poll_interval_secs > t.consensus_interval_secs {
            return Err(Error::Configuration(
                "Leader poll interval cannot exceed the consensus interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// A statically configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PeerConfig {
    /// Peer identity
    pub node_id: NodeId,
    /// Base URL of the peer's federation API
    #[validate(length(min = 1, max = 512))]
    pub endpoint: String,
}

/// Protocol timing, in whole seconds unless noted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimingConfig {
    /// Heartbeat broadcast period
    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_interval_secs: u64,
    /// Periodic consensus pass period
    #[validate(range(min = 1, max = 86400))]
    pub consensus_interval_secs: u64,
    /// Leader watchdog period
    #[validate(range(min = 1, max = 3600))]
    pub leader_poll_interval_secs: u64,
    /// Age after which a peer record stops counting in elections
    #[validate(range(min = 1, max = 86400))]
    pub stale_threshold_secs: u64,
    /// Accepted skew between a message's `sent_at` and the receiver's clock
    #[validate(range(min = 1, max = 86400))]
    pub freshness_window_secs: u64,
    /// How long a new winner waits for the old leader's acknowledgment
    #[validate(range(min = 10, max = 20))]
    pub handover_window_secs: u64,
    /// Per-peer send timeout in milliseconds
    #[validate(range(min = 100, max = 30000))]
    pub send_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            consensus_interval_secs: 180,
            leader_poll_interval_secs: 10,
            stale_threshold_secs: 300,
            freshness_window_secs: 300,
            handover_window_secs: 15,
            send_timeout_ms: 2000,
        }
    }
}

impl TimingConfig {
    /// Heartbeat broadcast period
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Periodic consensus pass period
    pub const fn consensus_interval(&self) -> Duration {
        Duration::from_secs(self.consensus_interval_secs)
    }

    /// Leader watchdog period
    pub const fn leader_poll_interval(&self) -> Duration {
        Duration::from_secs(self.leader_poll_interval_secs)
    }

    /// Stale threshold
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    /// Freshness window
    pub const fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    /// Handover acknowledgment window
    pub const fn handover_window(&self) -> Duration {
        Duration::from_secs(self.handover_window_secs)
    }

    /// Per-peer send timeout
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the federation API listens on
    pub bind_address: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind_address: SocketAddr::from(([0, 0, 0, 0], 8787)) }
    }
}

/// Configuration builder for fluent API
#[derive(Debug, Default)]
pub struct FederationConfigBuilder {
    node_id: Option<NodeId>,
    cluster_root: Option<String>,
    peers: Vec<PeerConfig>,
    timing: Option<TimingConfig>,
    api: Option<ApiConfig>,
}

impl FederationConfigBuilder {
    /// Set the node ID
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the cluster root
    #[must_use]
    pub fn cluster_root<S: Into<String>>(mut self, root: S) -> Self {
        self.cluster_root = Some(root.into());
        self
    }

    /// Add a peer
    #[must_use]
    pub fn add_peer(mut self, node_id: impl Into<NodeId>, endpoint: impl Into<String>) -> Self {
        self.peers.push(PeerConfig { node_id: node_id.into(), endpoint: endpoint.into() });
        self
    }

    /// Set timing configuration
    #[must_use]
    pub fn timing(mut self, config: TimingConfig) -> Self {
        self.timing = Some(config);
        self
    }

    /// Set API configuration
    #[must_use]
    pub fn api(mut self, config: ApiConfig) -> Self {
        self.api = Some(config);
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// Returns an error if required fields are missing or validation fails
    pub fn build(self) -> Result<FederationConfig> {
        let config = FederationConfig {
            node_id: self
                .node_id
                .ok_or_else(|| Error::Configuration("Node ID is required".to_string()))?,
            cluster_root: self
                .cluster_root
                .ok_or_else(|| Error::Configuration("Cluster root is required".to_string()))?,
            peers: self.peers,
            timing: self.timing.unwrap_or_default(),
            api: self.api.unwrap_or_default(),
        };

        config.validate_config()?;
        Ok(config)
    }
}
