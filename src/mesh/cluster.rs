//! Cluster management using Chitchat.
//!
//! Edge coordinators gossip a small amount of state: one monotonically
//! increasing invalidation epoch per metadata kind. A node that writes an
//! override bumps its epoch; peers notice the change and drop their cached
//! copies of that kind.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::config::MeshConfig;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "keygate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

impl From<&MeshConfig> for ClusterConfig {
    fn from(mesh: &MeshConfig) -> Self {
        Self {
            node_id: mesh
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            listen_addr: mesh.listen_addr,
            advertise_addr: mesh.advertise_addr.unwrap_or(mesh.listen_addr),
            seed_nodes: mesh.seed_nodes.clone(),
            cluster_id: mesh.cluster_id.clone(),
            gossip_interval: Duration::from_millis(mesh.gossip_interval_ms),
            ..Self::default()
        }
    }
}

/// Metadata whose caches a peer may ask us to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationKind {
    Keys,
    Overrides,
}

impl InvalidationKind {
    pub const ALL: [InvalidationKind; 2] = [InvalidationKind::Keys, InvalidationKind::Overrides];

    /// Chitchat key holding a node's epoch for this kind.
    pub fn chitchat_key(&self) -> &'static str {
        match self {
            InvalidationKind::Keys => "invalidate|keys",
            InvalidationKind::Overrides => "invalidate|overrides",
        }
    }
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Bump our epoch for `kind` and return its new value.
    pub async fn publish_invalidation(&self, kind: InvalidationKind) -> u64 {
        let chitchat_arc = self.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current: u64 = chitchat
            .self_node_state()
            .get(kind.chitchat_key())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        chitchat
            .self_node_state()
            .set(kind.chitchat_key(), next.to_string());

        debug!(kind = ?kind, epoch = next, "Published invalidation");
        next
    }

    /// Epochs for `kind` published by live peers, keyed by node id.
    pub async fn peer_epochs(&self, kind: InvalidationKind) -> HashMap<String, u64> {
        let chitchat_arc = self.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let mut epochs = HashMap::new();
        for node in chitchat.live_nodes() {
            if node.node_id == self.node_id {
                continue;
            }
            if let Some(epoch) = chitchat
                .node_state(node)
                .and_then(|state| state.get(kind.chitchat_key()))
                .and_then(|value| value.parse::<u64>().ok())
            {
                epochs.insert(node.node_id.clone(), epoch);
            }
        }
        epochs
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Poll peers' epochs and call `on_invalidate` for every kind a peer bumped,
    /// until `shutdown` flips.
    pub async fn watch_invalidations<F>(
        self: Arc<Self>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        on_invalidate: F,
    ) where
        F: Fn(InvalidationKind) + Send + Sync + 'static,
    {
        let mut tracker = EpochTracker::default();
        let mut ticker = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            for kind in InvalidationKind::ALL {
                let epochs = self.peer_epochs(kind).await;
                if tracker.observe(kind, &epochs) {
                    debug!(kind = ?kind, "Peer invalidation received");
                    on_invalidate(kind);
                }
            }
        }
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Remembers the last epoch seen from each peer.
#[derive(Debug, Default)]
pub struct EpochTracker {
    seen: HashMap<(InvalidationKind, String), u64>,
}

impl EpochTracker {
    /// Record `epochs` and report whether any peer moved past what we saw.
    pub fn observe(&mut self, kind: InvalidationKind, epochs: &HashMap<String, u64>) -> bool {
        let mut changed = false;
        for (node_id, epoch) in epochs {
            let last = self.seen.entry((kind, node_id.clone())).or_insert(0);
            if *epoch > *last {
                *last = *epoch;
                changed = true;
            }
        }
        changed
    }
}
