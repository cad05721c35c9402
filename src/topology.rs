//! Choosing which node to isolate.
//!
//! The target is the first replica node that does not host the nexus.
//! Its peers are the addresses of every other cluster node, so cutting
//! them isolates the target from the nexus and from any spare node the
//! control plane could move the replica to.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::info;
use uuid::Uuid;

use crate::cluster::ClusterNode;
use crate::cluster::ClusterState;
use crate::cluster::VolumeTopology;
use crate::error::ClusterSnafu;
use crate::error::HarnessError;

/// The node to isolate and the peer addresses to cut it off from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationTarget {
    pub node: String,
    pub address: IpAddr,
    pub peers: Vec<String>,
}

/// Resolves isolation targets from live placement.
#[derive(Clone)]
pub struct TopologyResolver {
    cluster: Arc<dyn ClusterState>,
}

impl TopologyResolver {
    pub fn new(cluster: Arc<dyn ClusterState>) -> Self {
        Self { cluster }
    }

    pub async fn resolve(&self, volume: Uuid) -> Result<IsolationTarget, HarnessError> {
        let nodes = self.cluster.nodes().await.context(ClusterSnafu)?;
        let topology = self.cluster.topology(volume).await.context(ClusterSnafu)?;
        let target = select_isolation_target(volume, &nodes, &topology)?;

        info!(
            volume = %volume,
            target_node = %target.node,
            peers = ?target.peers,
            "resolved isolation target"
        );
        Ok(target)
    }
}

/// Pick the isolation target for `volume`.
///
/// Fails when the volume is unpublished, when every replica shares the
/// nexus node, or when isolating the target would leave no peers.
pub fn select_isolation_target(
    volume: Uuid,
    nodes: &[ClusterNode],
    topology: &VolumeTopology,
) -> Result<IsolationTarget, HarnessError> {
    let Some(nexus_node) = topology.nexus_node.as_deref() else {
        return Err(HarnessError::NexusNotPublished { volume });
    };

    let node = topology
        .replica_nodes
        .iter()
        .find(|replica| replica.as_str() != nexus_node)
        .ok_or(HarnessError::NoIsolationCandidate { volume })?;

    let address = nodes
        .iter()
        .find(|n| &n.name == node)
        .map(|n| n.address)
        .ok_or_else(|| HarnessError::UnknownNode { node: node.clone() })?;

    let mut peers: Vec<String> = Vec::new();
    for n in nodes.iter().filter(|n| n.address != address) {
        let peer = n.address.to_string();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    if peers.is_empty() {
        return Err(HarnessError::NoPeers { target: node.clone() });
    }

    Ok(IsolationTarget {
        node: node.clone(),
        address,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn node(name: &str, last: u8) -> ClusterNode {
        ClusterNode::new(name, IpAddr::V4(Ipv4Addr::new(10, 1, 0, last)))
    }

    fn cluster() -> Vec<ClusterNode> {
        vec![node("node-1", 1), node("node-2", 2), node("node-3", 3), node("node-4", 4)]
    }

    fn topology(nexus: &str, replicas: &[&str]) -> VolumeTopology {
        VolumeTopology {
            nexus_node: Some(nexus.to_string()),
            replica_nodes: replicas.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_selects_first_non_nexus_replica() {
        let placement = topology("node-1", &["node-1", "node-3"]);
        let target = select_isolation_target(Uuid::nil(), &cluster(), &placement).unwrap();

        assert_eq!(target.node, "node-3");
        assert_eq!(target.address.to_string(), "10.1.0.3");
        assert_eq!(target.peers, vec!["10.1.0.1", "10.1.0.2", "10.1.0.4"]);
    }

    #[test]
    fn test_skips_nexus_even_when_listed_first() {
        let placement = topology("node-2", &["node-2", "node-4", "node-3"]);
        let target = select_isolation_target(Uuid::nil(), &cluster(), &placement).unwrap();
        assert_eq!(target.node, "node-4");
    }

    #[test]
    fn test_all_replicas_on_nexus_node() {
        let err = select_isolation_target(Uuid::nil(), &cluster(), &topology("node-1", &["node-1"])).unwrap_err();
        assert!(matches!(err, HarnessError::NoIsolationCandidate { .. }));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_unpublished_volume() {
        let topology = VolumeTopology {
            nexus_node: None,
            replica_nodes: vec!["node-2".into()],
        };
        let err = select_isolation_target(Uuid::nil(), &cluster(), &topology).unwrap_err();
        assert!(matches!(err, HarnessError::NexusNotPublished { .. }));
    }

    #[test]
    fn test_no_peers() {
        let nodes = vec![node("node-2", 2)];
        let err = select_isolation_target(Uuid::nil(), &nodes, &topology("node-1", &["node-2"])).unwrap_err();
        assert!(matches!(err, HarnessError::NoPeers { target } if target == "node-2"));
    }

    #[test]
    fn test_replica_on_unknown_node() {
        let err = select_isolation_target(Uuid::nil(), &cluster(), &topology("node-1", &["node-9"])).unwrap_err();
        assert!(matches!(err, HarnessError::UnknownNode { .. }));
    }

    #[test]
    fn test_nodes_sharing_target_address_are_not_peers() {
        let mut nodes = cluster();
        nodes.push(node("node-3-alias", 3));
        let target = select_isolation_target(Uuid::nil(), &nodes, &topology("node-1", &["node-3"])).unwrap();
        assert!(!target.peers.contains(&"10.1.0.3".to_string()));
        assert_eq!(target.peers.len(), 3);
    }
}
