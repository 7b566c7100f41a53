//! Server configuration.
//!
//! Command-line flags come from clap; cluster membership comes from a TOML
//! file so that every node can be started with the same file:
//!
//! ```toml
//! stripe_count = 4
//!
//! [[node]]
//! id = 1
//! hostname = "keel-a"
//! kind = "server"
//! port = 7100
//! private_v4 = "10.0.0.1"
//! stripes = [0, 2]
//! ```

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use keel_core::{ClusterMap, HandshakeKey, LinkConfig, RequestTableConfig};
use keel_ledger::LedgerConfig;
use keel_proto::segment::DEFAULT_SEGMENT_CAPACITY;

use crate::error::ServerError;

/// Command-line arguments of `keel-server`.
#[derive(Debug, Clone, Parser)]
#[command(name = "keel-server", version, about = "Keel cluster node")]
pub struct Args {
    /// Id of this node in the cluster file
    #[arg(long, env = "KEEL_NODE_ID")]
    pub node_id: u32,

    /// Cluster membership file (TOML)
    #[arg(long, default_value = "cluster.toml")]
    pub cluster: PathBuf,

    /// Address for inter-node links (defaults to this node's port on all interfaces)
    #[arg(long)]
    pub rpc_bind: Option<SocketAddr>,

    /// Address for streaming clients
    #[arg(long, default_value = "0.0.0.0:7200")]
    pub stream_bind: SocketAddr,

    /// Directory holding the chain files
    #[arg(long, default_value = "./ledger")]
    pub ledger_dir: PathBuf,

    /// Project whose chains this node serves
    #[arg(long, default_value = "keel")]
    pub project: String,

    /// Shared handshake key, hex encoded
    #[arg(long, env = "KEEL_CLUSTER_KEY", hide_env_values = true)]
    pub key: String,

    /// Bytes per pooled segment
    #[arg(long, default_value_t = DEFAULT_SEGMENT_CAPACITY)]
    pub segment_capacity: usize,

    /// Outstanding requests allowed per link
    #[arg(long, default_value_t = 1000)]
    pub max_requests: usize,

    /// Seconds allowed for a link handshake
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout: u64,

    /// Seconds of silence before a link is dropped
    #[arg(long, default_value_t = 60)]
    pub idle_timeout: u64,

    /// Seconds to wait for peers to acknowledge a replicated change
    #[arg(long, default_value_t = 5)]
    pub replication_timeout: u64,

    /// Acknowledge appends before they reach disk
    #[arg(long)]
    pub no_sync: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Everything a node needs to start, independent of where it came from.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// This node's id
    pub node_id: u32,
    /// Cluster membership
    pub cluster: ClusterMap,
    /// Shared handshake key
    pub key: HandshakeKey,
    /// Directory holding the chain files
    pub ledger_dir: PathBuf,
    /// Project name
    pub project: String,
    /// Ledger write policy
    pub ledger: LedgerConfig,
    /// Link timeouts
    pub link: LinkConfig,
    /// Per-link request table sizing
    pub requests: RequestTableConfig,
    /// Bytes per pooled segment
    pub segment_capacity: usize,
    /// Wait for peer acknowledgement of a replicated change
    pub replication_timeout: Duration,
    /// Wait for the response to a single peer call
    pub call_timeout: Duration,
    /// Pause between attempts to reach a peer
    pub reconnect_delay: Duration,
}

impl NodeSettings {
    /// Settings with library defaults for everything but identity and storage.
    pub fn new(node_id: u32, cluster: ClusterMap, key: HandshakeKey, ledger_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            cluster,
            key,
            ledger_dir: ledger_dir.into(),
            project: "keel".to_owned(),
            ledger: LedgerConfig::default(),
            link: LinkConfig::default(),
            requests: RequestTableConfig::default(),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            replication_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl Args {
    /// Resolve flags and the cluster file into node settings.
    pub fn settings(&self) -> Result<NodeSettings, ServerError> {
        let cluster = load_cluster(&self.cluster)?;
        cluster.require(self.node_id)?;
        let key = HandshakeKey::from_hex(self.key.trim())?;

        let mut settings = NodeSettings::new(self.node_id, cluster, key, &self.ledger_dir);
        settings.project.clone_from(&self.project);
        settings.ledger = LedgerConfig { sync_on_write: !self.no_sync };
        settings.link = LinkConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            heartbeat_interval: Duration::from_secs((self.idle_timeout / 3).max(1)),
        };
        settings.requests = RequestTableConfig {
            max_capacity: self.max_requests,
            ..RequestTableConfig::default()
        };
        settings.segment_capacity = self.segment_capacity;
        settings.replication_timeout = Duration::from_secs(self.replication_timeout);
        Ok(settings)
    }

    /// Inter-node listen address.
    pub fn rpc_addr(&self, settings: &NodeSettings) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.rpc_bind {
            return Ok(addr);
        }
        let node = settings.cluster.require(settings.node_id)?;
        Ok(SocketAddr::from(([0, 0, 0, 0], node.port)))
    }
}

/// Read and validate a cluster membership file.
pub fn load_cluster(path: &Path) -> Result<ClusterMap, ServerError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ServerError::Config { path: path.to_path_buf(), message: e.to_string() })?;
    parse_cluster(&text).map_err(|message| ServerError::Config { path: path.to_path_buf(), message })
}

fn parse_cluster(text: &str) -> Result<ClusterMap, String> {
    toml::from_str(text).map_err(|e| e.to_string())
}
