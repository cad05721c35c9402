//! Read-mostly view of the storage cluster.
//!
//! The harness never owns volumes; it observes them through
//! [`ClusterState`] and only ever mutates the desired replica count.
//! State strings reported by the control plane are parsed into closed
//! enums. Anything outside the documented sets is an
//! [`ClusterError::UnexpectedState`], never a silently ignored value.

pub mod kubectl;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;
use uuid::Uuid;

pub use kubectl::KubectlCluster;

/// A cluster member. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    pub address: IpAddr,
}

impl ClusterNode {
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Volume lifecycle state as reported by the control plane.
///
/// Rebuilding is not a separate state: a volume with a rebuilding replica
/// reports `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Pending,
    Healthy,
    Degraded,
    Offline,
    Faulted,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Pending => "pending",
            VolumeState::Healthy => "healthy",
            VolumeState::Degraded => "degraded",
            VolumeState::Offline => "offline",
            VolumeState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeState {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VolumeState::Pending),
            "healthy" => Ok(VolumeState::Healthy),
            "degraded" => Ok(VolumeState::Degraded),
            "offline" => Ok(VolumeState::Offline),
            "faulted" => Ok(VolumeState::Faulted),
            other => UnexpectedStateSnafu {
                kind: "volume",
                value: other.to_string(),
            }
            .fail(),
        }
    }
}

/// State of the nexus aggregating the volume's replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NexusState {
    #[serde(rename = "NEXUS_ONLINE")]
    Online,
    #[serde(rename = "NEXUS_DEGRADED")]
    Degraded,
    #[serde(rename = "NEXUS_FAULTED")]
    Faulted,
}

impl NexusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NexusState::Online => "NEXUS_ONLINE",
            NexusState::Degraded => "NEXUS_DEGRADED",
            NexusState::Faulted => "NEXUS_FAULTED",
        }
    }
}

impl fmt::Display for NexusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NexusState {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEXUS_ONLINE" => Ok(NexusState::Online),
            "NEXUS_DEGRADED" => Ok(NexusState::Degraded),
            "NEXUS_FAULTED" => Ok(NexusState::Faulted),
            other => UnexpectedStateSnafu {
                kind: "nexus",
                value: other.to_string(),
            }
            .fail(),
        }
    }
}

/// State of one replica child of a nexus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildState {
    #[serde(rename = "CHILD_ONLINE")]
    Online,
    #[serde(rename = "CHILD_DEGRADED")]
    Degraded,
    #[serde(rename = "CHILD_FAULTED")]
    Faulted,
}

impl ChildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildState::Online => "CHILD_ONLINE",
            ChildState::Degraded => "CHILD_DEGRADED",
            ChildState::Faulted => "CHILD_FAULTED",
        }
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChildState {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHILD_ONLINE" => Ok(ChildState::Online),
            "CHILD_DEGRADED" => Ok(ChildState::Degraded),
            "CHILD_FAULTED" => Ok(ChildState::Faulted),
            other => UnexpectedStateSnafu {
                kind: "child",
                value: other.to_string(),
            }
            .fail(),
        }
    }
}

/// A replica child of a nexus, addressed by URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexusChild {
    pub uri: String,
    pub state: ChildState,
}

/// Where a volume's nexus and replicas currently live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTopology {
    /// Node hosting the nexus, `None` while the volume is unpublished.
    pub nexus_node: Option<String>,
    /// Nodes hosting a replica, in control plane order.
    pub replica_nodes: Vec<String>,
}

/// Queries against live cluster state.
///
/// Everything except [`ClusterState::set_replica_count`] is read-only.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Every node in the cluster with its address.
    async fn nodes(&self) -> Result<Vec<ClusterNode>, ClusterError>;

    async fn volume_state(&self, volume: Uuid) -> Result<VolumeState, ClusterError>;

    async fn nexus_state(&self, volume: Uuid) -> Result<NexusState, ClusterError>;

    async fn topology(&self, volume: Uuid) -> Result<VolumeTopology, ClusterError>;

    /// The nexus children in nexus order.
    async fn children(&self, volume: Uuid) -> Result<Vec<NexusChild>, ClusterError>;

    /// Desired replica count of the volume.
    async fn replica_count(&self, volume: Uuid) -> Result<u32, ClusterError>;

    async fn set_replica_count(&self, volume: Uuid, count: u32) -> Result<(), ClusterError>;
}

/// Cluster query errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClusterError {
    /// The query command could not be started.
    #[snafu(display("failed to run {command}: {source}"))]
    Spawn { command: String, source: std::io::Error },

    /// The query command exited unsuccessfully.
    #[snafu(display("{command} failed: {stderr}"))]
    CommandFailed { command: String, stderr: String },

    /// The query output was not the expected JSON.
    #[snafu(display("failed to decode {what}: {source}"))]
    Decode { what: String, source: serde_json::Error },

    /// The volume does not exist.
    #[snafu(display("volume {volume} not found"))]
    VolumeNotFound { volume: Uuid },

    /// A field the harness depends on is absent.
    #[snafu(display("volume {volume} has no {field}"))]
    MissingField { volume: Uuid, field: &'static str },

    /// A node reported no usable address.
    #[snafu(display("node {node} has no valid internal address"))]
    NodeAddress { node: String },

    /// A state string outside the documented set.
    #[snafu(display("unexpected {kind} state '{value}'"))]
    UnexpectedState { kind: &'static str, value: String },

    /// The nexus has a different number of children than the check requires.
    #[snafu(display("volume {volume} has {actual} children, expected {expected}"))]
    ChildCount { volume: Uuid, expected: usize, actual: usize },
}
