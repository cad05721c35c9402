//! In-memory cluster with deterministic state progressions.
//!
//! [`SimulatedCluster`] implements every external interface the harness
//! consumes. Volume, nexus and child states are derived from the current
//! tokio time and the set of active isolation edges, so under a paused
//! clock every progression happens at a known virtual instant:
//!
//! - an isolated replica node is lost `detection` after its first edge
//!   goes up, its child faults and the volume degrades
//! - with reassignment enabled, a lost replica moves to a spare node
//!   `reassignment` after detection and rebuilds for `rebuild`
//! - a lost replica whose node is reconnected recovers after `recovery`
//! - new replicas attach after `attach` and rebuild for `rebuild`

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use nexus_chaos_network::FaultAction;
use nexus_chaos_network::FaultControl;
use nexus_chaos_network::FaultError;
use nexus_chaos_network::IsolationMethod;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::ChildState;
use crate::cluster::ClusterError;
use crate::cluster::ClusterNode;
use crate::cluster::ClusterState;
use crate::cluster::NexusChild;
use crate::cluster::NexusState;
use crate::cluster::VolumeState;
use crate::cluster::VolumeTopology;
use crate::load::LoadError;
use crate::load::Workload;
use crate::provision::ProvisionError;
use crate::provision::Provisioner;

/// Delays of the simulated control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTiming {
    pub detection: Duration,
    pub reassignment: Duration,
    pub rebuild: Duration,
    pub recovery: Duration,
    pub attach: Duration,
    pub pod_start: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            detection: Duration::from_secs(3),
            reassignment: Duration::from_secs(5),
            rebuild: Duration::from_secs(8),
            recovery: Duration::from_secs(2),
            attach: Duration::from_secs(2),
            pod_start: Duration::from_secs(2),
        }
    }
}

/// A call made against the simulated cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Fault {
        target: String,
        peer: String,
        action: FaultAction,
        method: IsolationMethod,
    },
    Workload {
        run: u32,
        duration: Duration,
    },
    SetReplicaCount {
        volume: Uuid,
        count: u32,
    },
    CreateClaim {
        name: String,
    },
    DeleteClaim {
        name: String,
    },
    CreateWorkload {
        pod: String,
    },
    DeleteWorkload {
        pod: String,
    },
}

#[derive(Debug)]
struct SimReplica {
    node: String,
    uri: String,
    attached_at: Instant,
    online_at: Instant,
}

#[derive(Debug)]
struct SimVolume {
    nexus_node: Option<String>,
    replicas: Vec<SimReplica>,
    replica_count: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Faults {
    disconnect: HashSet<String>,
    reconnect: HashSet<String>,
    workload_runs: HashSet<u32>,
    never_degrade: bool,
    no_reassignment: bool,
    deletes: bool,
}

#[derive(Debug)]
struct Inner {
    nodes: Vec<ClusterNode>,
    volumes: BTreeMap<Uuid, SimVolume>,
    edges: BTreeSet<(String, String)>,
    isolated_since: HashMap<String, Instant>,
    calls: Vec<SimCall>,
    faults: Faults,
    workload_runs: u32,
    claims: HashMap<String, Uuid>,
    pods: HashMap<String, Instant>,
    claim_replicas: usize,
    next_volume: u128,
}

/// Deterministic in-memory cluster for scenario tests.
///
/// One value stands in for every external collaborator: it answers
/// [`ClusterState`] queries, applies faults as [`FaultControl`], runs the
/// [`Workload`] and provisions through [`Provisioner`]. Progressions follow
/// [`SimTiming`] against the tokio clock (see the module docs).
///
/// Every call is recorded as a [`SimCall`]. Failures can be injected per
/// peer, per workload run or per delete.
pub struct SimulatedCluster {
    timing: SimTiming,
    inner: Mutex<Inner>,
}

impl SimulatedCluster {
    /// A cluster of `node_count` nodes named `node-1..` at `10.1.0.1..`.
    pub fn new(node_count: usize) -> Self {
        let nodes = (1..=node_count)
            .map(|i| {
                let address = IpAddr::V4(Ipv4Addr::new(10, 1, (i / 256) as u8, (i % 256) as u8));
                ClusterNode::new(format!("node-{i}"), address)
            })
            .collect();

        Self {
            timing: SimTiming::default(),
            inner: Mutex::new(Inner {
                nodes,
                volumes: BTreeMap::new(),
                edges: BTreeSet::new(),
                isolated_since: HashMap::new(),
                calls: Vec::new(),
                faults: Faults::default(),
                workload_runs: 0,
                claims: HashMap::new(),
                pods: HashMap::new(),
                claim_replicas: 2,
                next_volume: 1,
            }),
        }
    }

    pub fn with_timing(mut self, timing: SimTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn timing(&self) -> SimTiming {
        self.timing
    }

    /// Add a healthy volume with its nexus on `nexus` and one replica per
    /// entry of `replicas`.
    pub fn add_volume(&self, nexus: &str, replicas: &[&str]) -> Uuid {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_volume += 1;
            Uuid::from_u128(inner.next_volume)
        };
        self.add_volume_with_id(id, nexus, replicas);
        id
    }

    pub fn add_volume_with_id(&self, id: Uuid, nexus: &str, replicas: &[&str]) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut volume = SimVolume {
            nexus_node: Some(nexus.to_string()),
            replicas: Vec::new(),
            replica_count: replicas.len() as u32,
            generation: 0,
        };
        for node in replicas {
            let uri = replica_uri(&inner.nodes, id, nexus, node, &mut volume.generation);
            volume.replicas.push(SimReplica {
                node: node.to_string(),
                uri,
                attached_at: now,
                online_at: now,
            });
        }
        inner.volumes.insert(id, volume);
    }

    /// Disconnects towards `peer` fail.
    pub fn fail_disconnect(&self, peer: &str) {
        self.inner.lock().faults.disconnect.insert(peer.to_string());
    }

    /// Reconnects towards `peer` fail.
    pub fn fail_reconnect(&self, peer: &str) {
        self.inner.lock().faults.reconnect.insert(peer.to_string());
    }

    /// Workload run number `run` (1-based, in start order) fails.
    pub fn fail_workload_run(&self, run: u32) {
        self.inner.lock().faults.workload_runs.insert(run);
    }

    /// Isolation never degrades any volume.
    pub fn never_degrade(&self) {
        self.inner.lock().faults.never_degrade = true;
    }

    /// Lost replicas are never moved to a spare node.
    pub fn disable_reassignment(&self) {
        self.inner.lock().faults.no_reassignment = true;
    }

    /// Claim and pod deletion fail.
    pub fn fail_deletes(&self) {
        self.inner.lock().faults.deletes = true;
    }

    /// Replicas given to volumes created through [`Provisioner`].
    pub fn set_claim_replicas(&self, replicas: usize) {
        self.inner.lock().claim_replicas = replicas;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.inner.lock().calls.clone()
    }

    /// Fault control calls as `(target, peer, action)`.
    pub fn fault_calls(&self) -> Vec<(String, String, FaultAction)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SimCall::Fault {
                    target, peer, action, ..
                } => Some((target.clone(), peer.clone(), *action)),
                _ => None,
            })
            .collect()
    }

    /// Edges currently up as `(target, peer)`.
    pub fn active_edges(&self) -> Vec<(String, String)> {
        self.inner.lock().edges.iter().cloned().collect()
    }

    pub fn is_isolated(&self, node: &str) -> bool {
        self.inner.lock().isolated_since.contains_key(node)
    }

    pub fn workload_runs(&self) -> u32 {
        self.inner.lock().workload_runs
    }

    pub fn replica_nodes(&self, volume: Uuid) -> Vec<String> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, Instant::now());
        inner
            .volumes
            .get(&volume)
            .map(|v| v.replicas.iter().map(|r| r.node.clone()).collect())
            .unwrap_or_default()
    }

    fn is_lost(&self, inner: &Inner, node: &str, now: Instant) -> bool {
        !inner.faults.never_degrade
            && inner
                .isolated_since
                .get(node)
                .is_some_and(|since| now >= *since + self.timing.detection)
    }

    /// Move lost replicas whose reassignment time has passed to spare nodes.
    fn advance(&self, inner: &mut Inner, now: Instant) {
        if inner.faults.no_reassignment || inner.faults.never_degrade {
            return;
        }
        let Inner {
            nodes,
            volumes,
            isolated_since,
            ..
        } = inner;

        for (id, volume) in volumes.iter_mut() {
            for index in 0..volume.replicas.len() {
                let Some(since) = isolated_since.get(&volume.replicas[index].node) else {
                    continue;
                };
                let moved_at = *since + self.timing.detection + self.timing.reassignment;
                if now < moved_at {
                    continue;
                }

                let spare = nodes.iter().find(|n| {
                    Some(&n.name) != volume.nexus_node.as_ref()
                        && !isolated_since.contains_key(&n.name)
                        && !volume.replicas.iter().any(|r| r.node == n.name)
                });
                let Some(spare) = spare else {
                    continue;
                };

                let nexus = volume.nexus_node.clone().unwrap_or_default();
                let uri = replica_uri(nodes, *id, &nexus, &spare.name, &mut volume.generation);
                debug!(volume = %id, from = %volume.replicas[index].node, to = %spare.name, "replica reassigned");
                volume.replicas[index] = SimReplica {
                    node: spare.name.clone(),
                    uri,
                    attached_at: moved_at,
                    online_at: moved_at + self.timing.rebuild,
                };
            }
        }
    }

    fn with_volume<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&Inner, &SimVolume, Instant) -> Result<T, ClusterError>,
    ) -> Result<T, ClusterError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.advance(&mut inner, now);
        let volume = inner.volumes.get(&id).ok_or(ClusterError::VolumeNotFound { volume: id })?;
        f(&inner, volume, now)
    }

    fn children_of(&self, inner: &Inner, volume: &SimVolume, now: Instant) -> Vec<NexusChild> {
        volume
            .replicas
            .iter()
            .filter(|r| r.attached_at <= now)
            .map(|r| {
                let state = if self.is_lost(inner, &r.node, now) {
                    ChildState::Faulted
                } else if now < r.online_at {
                    ChildState::Degraded
                } else {
                    ChildState::Online
                };
                NexusChild {
                    uri: r.uri.clone(),
                    state,
                }
            })
            .collect()
    }

    fn nexus_state_of(&self, inner: &Inner, volume: &SimVolume, now: Instant) -> NexusState {
        let children = self.children_of(inner, volume, now);
        if children.iter().all(|c| c.state == ChildState::Faulted) {
            NexusState::Faulted
        } else if children.len() < volume.replica_count as usize
            || children.iter().any(|c| c.state != ChildState::Online)
        {
            NexusState::Degraded
        } else {
            NexusState::Online
        }
    }

    fn record(&self, call: SimCall) {
        self.inner.lock().calls.push(call);
    }
}

fn replica_uri(nodes: &[ClusterNode], volume: Uuid, nexus: &str, node: &str, generation: &mut u32) -> String {
    *generation += 1;
    if node == nexus {
        return format!("bdev:///{volume}");
    }
    let address = nodes
        .iter()
        .find(|n| n.name == node)
        .map(|n| n.address.to_string())
        .unwrap_or_else(|| node.to_string());
    format!("nvmf://{address}:8420/nqn.2019-05.io.openebs:{volume}-{generation}")
}

#[async_trait]
impl ClusterState for SimulatedCluster {
    async fn nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        Ok(self.inner.lock().nodes.clone())
    }

    async fn volume_state(&self, volume: Uuid) -> Result<VolumeState, ClusterError> {
        self.with_volume(volume, |inner, v, now| {
            if v.nexus_node.is_none() {
                return Ok(VolumeState::Pending);
            }
            Ok(match self.nexus_state_of(inner, v, now) {
                NexusState::Online => VolumeState::Healthy,
                NexusState::Degraded => VolumeState::Degraded,
                NexusState::Faulted => VolumeState::Faulted,
            })
        })
    }

    async fn nexus_state(&self, volume: Uuid) -> Result<NexusState, ClusterError> {
        self.with_volume(volume, |inner, v, now| {
            if v.nexus_node.is_none() {
                return Err(ClusterError::MissingField { volume, field: "nexus" });
            }
            Ok(self.nexus_state_of(inner, v, now))
        })
    }

    async fn topology(&self, volume: Uuid) -> Result<VolumeTopology, ClusterError> {
        self.with_volume(volume, |_, v, _| {
            Ok(VolumeTopology {
                nexus_node: v.nexus_node.clone(),
                replica_nodes: v.replicas.iter().map(|r| r.node.clone()).collect(),
            })
        })
    }

    async fn children(&self, volume: Uuid) -> Result<Vec<NexusChild>, ClusterError> {
        self.with_volume(volume, |inner, v, now| {
            if v.nexus_node.is_none() {
                return Err(ClusterError::MissingField { volume, field: "nexus" });
            }
            Ok(self.children_of(inner, v, now))
        })
    }

    async fn replica_count(&self, volume: Uuid) -> Result<u32, ClusterError> {
        self.with_volume(volume, |_, v, _| Ok(v.replica_count))
    }

    async fn set_replica_count(&self, volume: Uuid, count: u32) -> Result<(), ClusterError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.calls.push(SimCall::SetReplicaCount { volume, count });

        let Inner {
            nodes,
            volumes,
            isolated_since,
            ..
        } = &mut *inner;
        let v = volumes.get_mut(&volume).ok_or(ClusterError::VolumeNotFound { volume })?;
        let nexus = v.nexus_node.clone().unwrap_or_default();

        while v.replicas.len() < count as usize {
            let Some(spare) = nodes
                .iter()
                .find(|n| !isolated_since.contains_key(&n.name) && !v.replicas.iter().any(|r| r.node == n.name))
            else {
                return Err(ClusterError::CommandFailed {
                    command: format!("set replica count of {volume} to {count}"),
                    stderr: "no node available for a new replica".into(),
                });
            };
            let attached_at = now + self.timing.attach;
            let uri = replica_uri(nodes, volume, &nexus, &spare.name, &mut v.generation);
            v.replicas.push(SimReplica {
                node: spare.name.clone(),
                uri,
                attached_at,
                online_at: attached_at + self.timing.rebuild,
            });
        }
        v.replicas.truncate(count as usize);
        v.replica_count = count;
        Ok(())
    }
}

#[async_trait]
impl FaultControl for SimulatedCluster {
    async fn apply(
        &self,
        target: &str,
        peer: &str,
        action: FaultAction,
        method: IsolationMethod,
    ) -> Result<(), FaultError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.calls.push(SimCall::Fault {
            target: target.to_string(),
            peer: peer.to_string(),
            action,
            method,
        });

        let failing = match action {
            FaultAction::Disconnect => inner.faults.disconnect.contains(peer),
            FaultAction::Reconnect => inner.faults.reconnect.contains(peer),
        };
        if failing {
            return Err(FaultError::CommandFailed {
                command: format!("simulated {action} {target} {peer} {method}"),
                code: Some(1),
                stderr: "simulated fault control failure".into(),
            });
        }

        let edge = (target.to_string(), peer.to_string());
        match action {
            FaultAction::Disconnect => {
                if inner.edges.insert(edge) {
                    inner.isolated_since.entry(target.to_string()).or_insert(now);
                }
            }
            FaultAction::Reconnect => {
                inner.edges.remove(&edge);
                let still_isolated = inner.edges.iter().any(|(t, _)| t == target);
                if !still_isolated && let Some(since) = inner.isolated_since.remove(target) {
                    let lost = !inner.faults.never_degrade && now >= since + self.timing.detection;
                    if lost {
                        let online_at = now + self.timing.recovery;
                        for volume in inner.volumes.values_mut() {
                            for replica in volume.replicas.iter_mut().filter(|r| r.node == target) {
                                replica.online_at = replica.online_at.max(online_at);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for SimulatedCluster {
    async fn run(&self, duration: Duration) -> Result<(), LoadError> {
        let run = {
            let mut inner = self.inner.lock();
            inner.workload_runs += 1;
            let run = inner.workload_runs;
            inner.calls.push(SimCall::Workload { run, duration });
            run
        };

        tokio::time::sleep(duration).await;

        if self.inner.lock().faults.workload_runs.contains(&run) {
            return Err(LoadError::Rejected {
                reason: format!("simulated I/O error in run {run}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for SimulatedCluster {
    async fn create_volume_claim(&self, name: &str, _storage_class: &str) -> Result<Uuid, ProvisionError> {
        self.record(SimCall::CreateClaim { name: name.to_string() });
        let (nexus, replicas) = {
            let inner = self.inner.lock();
            let names: Vec<String> = inner.nodes.iter().map(|n| n.name.clone()).collect();
            if names.len() < inner.claim_replicas || names.is_empty() {
                return Err(ProvisionError::Operation {
                    operation: "create volume claim",
                    name: name.to_string(),
                    reason: format!("{} nodes cannot hold {} replicas", names.len(), inner.claim_replicas),
                });
            }
            let replicas: Vec<String> = names.iter().take(inner.claim_replicas).cloned().collect();
            (names[0].clone(), replicas)
        };

        let replica_refs: Vec<&str> = replicas.iter().map(String::as_str).collect();
        let volume = self.add_volume(&nexus, &replica_refs);
        self.inner.lock().claims.insert(name.to_string(), volume);
        Ok(volume)
    }

    async fn delete_volume_claim(&self, name: &str) -> Result<(), ProvisionError> {
        self.record(SimCall::DeleteClaim { name: name.to_string() });
        let mut inner = self.inner.lock();
        if inner.faults.deletes {
            return Err(ProvisionError::Operation {
                operation: "delete volume claim",
                name: name.to_string(),
                reason: "simulated failure".into(),
            });
        }
        let volume = inner.claims.remove(name).ok_or_else(|| ProvisionError::NotFound {
            kind: "volume claim",
            name: name.to_string(),
        })?;
        inner.volumes.remove(&volume);
        Ok(())
    }

    async fn create_workload(&self, pod: &str, claim: &str) -> Result<(), ProvisionError> {
        self.record(SimCall::CreateWorkload { pod: pod.to_string() });
        let mut inner = self.inner.lock();
        if !inner.claims.contains_key(claim) {
            return Err(ProvisionError::NotFound {
                kind: "volume claim",
                name: claim.to_string(),
            });
        }
        inner.pods.insert(pod.to_string(), Instant::now());
        Ok(())
    }

    async fn delete_workload(&self, pod: &str) -> Result<(), ProvisionError> {
        self.record(SimCall::DeleteWorkload { pod: pod.to_string() });
        let mut inner = self.inner.lock();
        if inner.faults.deletes {
            return Err(ProvisionError::Operation {
                operation: "delete workload",
                name: pod.to_string(),
                reason: "simulated failure".into(),
            });
        }
        inner.pods.remove(pod).map(|_| ()).ok_or_else(|| ProvisionError::NotFound {
            kind: "pod",
            name: pod.to_string(),
        })
    }

    async fn workload_ready(&self, pod: &str) -> Result<bool, ProvisionError> {
        let inner = self.inner.lock();
        let created = inner.pods.get(pod).ok_or_else(|| ProvisionError::NotFound {
            kind: "pod",
            name: pod.to_string(),
        })?;
        Ok(Instant::now() >= *created + self.timing.pod_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn isolate(cluster: &SimulatedCluster, target: &str, peers: &[&str]) {
        for peer in peers {
            cluster
                .apply(target, peer, FaultAction::Disconnect, IsolationMethod::Reject)
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolation_degrades_after_detection() {
        let cluster = SimulatedCluster::new(3);
        cluster.disable_reassignment();
        let volume = cluster.add_volume("node-1", &["node-1", "node-2"]);
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Healthy);

        isolate(&cluster, "node-2", &["10.1.0.1", "10.1.0.3"]).await;
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Healthy);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Degraded);
        let children = cluster.children(volume).await.unwrap();
        assert_eq!(children[1].state, ChildState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassignment_moves_replica_to_spare() {
        let cluster = SimulatedCluster::new(4);
        let volume = cluster.add_volume("node-1", &["node-1", "node-2"]);
        isolate(&cluster, "node-2", &["10.1.0.1", "10.1.0.3", "10.1.0.4"]).await;

        // detection + reassignment + rebuild
        tokio::time::sleep(Duration::from_secs(3 + 5)).await;
        assert_eq!(cluster.replica_nodes(volume), vec!["node-1", "node-3"]);
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Degraded);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_lost_replica() {
        let cluster = SimulatedCluster::new(2);
        let volume = cluster.add_volume("node-1", &["node-1", "node-2"]);
        isolate(&cluster, "node-2", &["10.1.0.1"]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Degraded);

        cluster
            .apply("node-2", "10.1.0.1", FaultAction::Reconnect, IsolationMethod::Reject)
            .await
            .unwrap();
        assert!(!cluster.is_isolated("node-2"));
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Degraded);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cluster.volume_state(volume).await.unwrap(), VolumeState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_replica_attaches_then_rebuilds() {
        let cluster = SimulatedCluster::new(3);
        let volume = cluster.add_volume("node-1", &["node-1"]);
        cluster.set_replica_count(volume, 2).await.unwrap();
        assert_eq!(cluster.replica_count(volume).await.unwrap(), 2);
        assert_eq!(cluster.children(volume).await.unwrap().len(), 1);
        assert_eq!(cluster.nexus_state(volume).await.unwrap(), NexusState::Degraded);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let children = cluster.children(volume).await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].state, ChildState::Degraded);

        tokio::time::sleep(Duration::from_secs(8)).await;
        let children = cluster.children(volume).await.unwrap();
        assert!(children.iter().all(|c| c.state == ChildState::Online));
        assert_eq!(cluster.nexus_state(volume).await.unwrap(), NexusState::Online);
    }

    #[tokio::test]
    async fn test_fault_control_is_idempotent() {
        let cluster = SimulatedCluster::new(2);
        isolate(&cluster, "node-2", &["10.1.0.1", "10.1.0.1"]).await;
        assert_eq!(cluster.active_edges().len(), 1);

        for _ in 0..2 {
            cluster
                .apply("node-2", "10.1.0.1", FaultAction::Reconnect, IsolationMethod::Reject)
                .await
                .unwrap();
        }
        assert!(cluster.active_edges().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_volume() {
        let cluster = SimulatedCluster::new(2);
        let err = cluster.volume_state(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, ClusterError::VolumeNotFound { .. }));
    }
}
