//! Cluster membership.
//!
//! Membership records are supplied by the outer service layer (in this
//! workspace, a TOML file read by the server). Each node owns a set of stripes
//! modulo the cluster-wide stripe count; [`ClusterMap::new`] refuses any map in
//! which two nodes share a stripe, because that is the one configuration in
//! which id assignment could collide.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Declared role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Serves project content
    Server,
    /// Hosts shared chains for several projects
    Host,
    /// Aggregates a region
    Region,
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node id, unique in the cluster
    pub id: u32,
    /// Host name
    pub hostname: String,
    /// Declared role
    pub kind: NodeKind,
    /// RPC port
    pub port: u16,
    /// Private IPv4 address
    #[serde(default)]
    pub private_v4: Option<Ipv4Addr>,
    /// Public IPv4 address
    #[serde(default)]
    pub public_v4: Option<Ipv4Addr>,
    /// Private IPv6 address
    #[serde(default)]
    pub private_v6: Option<Ipv6Addr>,
    /// Public IPv6 address
    #[serde(default)]
    pub public_v6: Option<Ipv6Addr>,
    /// Stripes this node assigns ids from
    #[serde(default)]
    pub stripes: Vec<u32>,
}

impl ClusterNode {
    /// Address peers should dial, preferring private networks and IPv4.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        let ip = self
            .private_v4
            .map(IpAddr::V4)
            .or(self.private_v6.map(IpAddr::V6))
            .or(self.public_v4.map(IpAddr::V4))
            .or(self.public_v6.map(IpAddr::V6))?;
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Validated cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawClusterMap", into = "RawClusterMap")]
pub struct ClusterMap {
    stripe_count: u32,
    nodes: Vec<ClusterNode>,
}

#[derive(Serialize, Deserialize)]
struct RawClusterMap {
    stripe_count: u32,
    #[serde(default, rename = "node")]
    nodes: Vec<ClusterNode>,
}

impl TryFrom<RawClusterMap> for ClusterMap {
    type Error = ClusterError;

    fn try_from(raw: RawClusterMap) -> Result<Self, ClusterError> {
        Self::new(raw.stripe_count, raw.nodes)
    }
}

impl From<ClusterMap> for RawClusterMap {
    fn from(map: ClusterMap) -> Self {
        Self { stripe_count: map.stripe_count, nodes: map.nodes }
    }
}

impl ClusterMap {
    /// Validate membership: unique node ids, stripes in range, no shared stripe.
    pub fn new(stripe_count: u32, nodes: Vec<ClusterNode>) -> Result<Self, ClusterError> {
        if stripe_count == 0 {
            return Err(ClusterError::ZeroStripeCount);
        }

        let mut owners: Vec<Option<u32>> = vec![None; stripe_count as usize];
        for (index, node) in nodes.iter().enumerate() {
            if nodes[..index].iter().any(|n| n.id == node.id) {
                return Err(ClusterError::DuplicateNode(node.id));
            }
            for &stripe in &node.stripes {
                let owner = owners
                    .get_mut(stripe as usize)
                    .ok_or(ClusterError::StripeOutOfRange { stripe, stripe_count })?;
                if let Some(first) = *owner {
                    return Err(ClusterError::StripeOverlap { stripe, first, second: node.id });
                }
                *owner = Some(node.id);
            }
        }

        Ok(Self { stripe_count, nodes })
    }

    /// Stripe count S.
    pub fn stripe_count(&self) -> u32 {
        self.stripe_count
    }

    /// All members.
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Member by id.
    pub fn node(&self, id: u32) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Member by id, or `UnknownNode`.
    pub fn require(&self, id: u32) -> Result<&ClusterNode, ClusterError> {
        self.node(id).ok_or(ClusterError::UnknownNode(id))
    }

    /// Node that assigned `id`, if its stripe is owned.
    pub fn owner_of(&self, id: u64) -> Option<&ClusterNode> {
        let stripe = (id % u64::from(self.stripe_count)) as u32;
        self.nodes.iter().find(|n| n.stripes.contains(&stripe))
    }

    /// Members other than `local`.
    pub fn peers(&self, local: u32) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(move |n| n.id != local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, stripes: &[u32]) -> ClusterNode {
        ClusterNode {
            id,
            hostname: format!("node{id}"),
            kind: NodeKind::Server,
            port: 7000,
            private_v4: Some(Ipv4Addr::new(10, 0, 0, id as u8)),
            public_v4: None,
            private_v6: None,
            public_v6: None,
            stripes: stripes.to_vec(),
        }
    }

    #[test]
    fn owner_follows_residue() {
        let map = ClusterMap::new(4, vec![node(1, &[0, 2]), node(2, &[1, 3])]).unwrap();
        assert_eq!(map.owner_of(10).map(|n| n.id), Some(1));
        assert_eq!(map.owner_of(7).map(|n| n.id), Some(2));
        assert_eq!(map.peers(1).map(|n| n.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn overlapping_stripes_are_rejected() {
        let result = ClusterMap::new(4, vec![node(1, &[0, 1]), node(2, &[1])]);
        assert_eq!(result, Err(ClusterError::StripeOverlap { stripe: 1, first: 1, second: 2 }));
    }

    #[test]
    fn out_of_range_stripe_is_rejected() {
        let result = ClusterMap::new(2, vec![node(1, &[2])]);
        assert_eq!(result, Err(ClusterError::StripeOutOfRange { stripe: 2, stripe_count: 2 }));
    }

    #[test]
    fn duplicate_node_is_rejected() {
        assert_eq!(ClusterMap::new(2, vec![node(1, &[0]), node(1, &[1])]), Err(ClusterError::DuplicateNode(1)));
        assert_eq!(ClusterMap::new(0, vec![]), Err(ClusterError::ZeroStripeCount));
    }

    #[test]
    fn rpc_addr_prefers_private_v4() {
        let mut n = node(3, &[]);
        n.public_v4 = Some(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(n.rpc_addr(), Some("10.0.0.3:7000".parse().unwrap()));
        n.private_v4 = None;
        assert_eq!(n.rpc_addr(), Some("1.2.3.4:7000".parse().unwrap()));
    }
}
