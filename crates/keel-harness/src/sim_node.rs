//! Complete nodes on simulated hosts.
//!
//! Every node of a simulated cluster listens for links on the same port of
//! its own turmoil host. Hosts are named after node ids (`node1`, `node2`,
//! ...) and addresses are resolved through turmoil's DNS, so the cluster map
//! carries no addresses.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use keel_core::{ClusterMap, ClusterNode, HandshakeKey, NodeKind};
use keel_server::{Node, NodeSettings, ServerError};

use crate::{SimEnv, SimTransport};

/// Link port every simulated node listens on.
pub const LINK_PORT: u16 = 7100;

/// How a simulated node is started.
#[derive(Debug, Clone)]
pub struct SimNodeConfig {
    /// Node id
    pub node_id: u32,
    /// Membership shared by the whole cluster
    pub cluster: ClusterMap,
    /// Handshake key
    pub key: HandshakeKey,
    /// Ledger directory
    pub ledger_dir: PathBuf,
    /// RNG seed
    pub seed: u64,
    /// Wait for peer acknowledgement of a replicated change
    pub replication_timeout: Duration,
}

impl SimNodeConfig {
    /// Settings the node is opened with.
    pub fn settings(&self) -> NodeSettings {
        let mut settings = NodeSettings::new(self.node_id, self.cluster.clone(), self.key.clone(), &self.ledger_dir);
        settings.ledger.sync_on_write = false;
        settings.replication_timeout = self.replication_timeout;
        settings.reconnect_delay = Duration::from_millis(200);
        settings
    }
}

/// Turmoil host name of `node_id`.
pub fn host_name(node_id: u32) -> String {
    format!("node{node_id}")
}

/// Cluster of `stripes.len()` nodes; node `i + 1` owns `stripes[i]`.
pub fn cluster(stripe_count: u32, stripes: &[&[u32]]) -> Result<ClusterMap, keel_core::ClusterError> {
    let nodes = stripes
        .iter()
        .zip(1u32..)
        .map(|(owned, id)| ClusterNode {
            id,
            hostname: host_name(id),
            kind: NodeKind::Server,
            port: LINK_PORT,
            private_v4: None,
            public_v4: None,
            private_v6: None,
            public_v6: None,
            stripes: owned.to_vec(),
        })
        .collect();
    ClusterMap::new(stripe_count, nodes)
}

/// A node running on the current turmoil host.
#[derive(Debug, Clone)]
pub struct SimNode {
    node: Arc<Node<SimEnv>>,
    dialer: Arc<SimTransport>,
}

impl SimNode {
    /// Open the node and accept links on [`LINK_PORT`]. Peers are not dialed
    /// until [`SimNode::dial_peers`].
    pub async fn start(config: &SimNodeConfig) -> Result<Self, ServerError> {
        let node = Node::open(config.settings(), SimEnv::with_seed(config.seed))?;
        let listener = SimTransport::bind(SocketAddr::from(([0, 0, 0, 0], LINK_PORT))).await?;

        let serving = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(err) = serving.serve_links(listener).await {
                tracing::warn!(error = %err, "simulated listener stopped");
            }
        });

        Ok(Self { node, dialer: Arc::new(SimTransport::dialer()) })
    }

    /// Dial every peer with a higher id and keep those links up.
    pub fn dial_peers(&self) {
        let me = self.node.node_id();
        for peer in self.node.settings().cluster.peers(me).filter(|p| p.id > me) {
            let addr = SocketAddr::new(turmoil::lookup(peer.hostname.as_str()), LINK_PORT);
            tokio::spawn(Arc::clone(&self.node).maintain_link(Arc::clone(&self.dialer), peer.id, addr));
        }
    }

    /// The running node.
    pub fn node(&self) -> &Arc<Node<SimEnv>> {
        &self.node
    }

    /// Wait until a link to `peer_id` is authenticated, up to `limit`.
    pub async fn wait_for_peer(&self, peer_id: u32, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.node.peer(peer_id).is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.node.peer(peer_id).is_some()
    }
}
