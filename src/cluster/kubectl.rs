//! [`ClusterState`] backed by `kubectl` and the MayastorVolume resource.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::ClusterError;
use super::ClusterNode;
use super::ClusterState;
use super::CommandFailedSnafu;
use super::DecodeSnafu;
use super::MissingFieldSnafu;
use super::NexusChild;
use super::NexusState;
use super::SpawnSnafu;
use super::VolumeNotFoundSnafu;
use super::VolumeState;
use super::VolumeTopology;

/// Resource name of the MayastorVolume custom resource.
const VOLUME_RESOURCE: &str = "msv";

/// Read-only view of a Mayastor cluster through `kubectl`.
///
/// Nodes come from `kubectl get nodes` (name plus the first `InternalIP`
/// address). Volume placement, volume state, nexus state and children are
/// read from the `msv` resource in `namespace`. Every query spawns one
/// `kubectl` process whose non-zero exit becomes
/// [`ClusterError::CommandFailed`] with the captured stderr.
///
/// Replica count changes patch `spec.replicaCount` on the same resource.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    binary: String,
    namespace: String,
    kubeconfig: Option<PathBuf>,
}

impl KubectlCluster {
    pub fn new(binary: impl Into<String>, namespace: impl Into<String>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            namespace: namespace.into(),
            kubeconfig,
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<Vec<u8>, ClusterError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "querying cluster");

        let output = cmd.output().await.context(SpawnSnafu { command: command.clone() })?;
        if !output.status.success() {
            return CommandFailedSnafu {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }
        Ok(output.stdout)
    }

    async fn volume(&self, volume: Uuid) -> Result<MsvResource, ClusterError> {
        let name = volume.to_string();
        let args = ["-n", self.namespace.as_str(), "get", VOLUME_RESOURCE, name.as_str(), "-o", "json"];
        match self.kubectl(&args).await {
            Ok(stdout) => parse_volume(&stdout),
            Err(ClusterError::CommandFailed { stderr, .. }) if stderr.contains("NotFound") => {
                VolumeNotFoundSnafu { volume }.fail()
            }
            Err(e) => Err(e),
        }
    }

    async fn nexus(&self, volume: Uuid) -> Result<MsvNexus, ClusterError> {
        self.volume(volume)
            .await?
            .status
            .and_then(|status| status.nexus)
            .ok_or_else(|| MissingFieldSnafu { volume, field: "nexus" }.build())
    }
}

#[async_trait]
impl ClusterState for KubectlCluster {
    async fn nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        let stdout = self.kubectl(&["get", "nodes", "-o", "json"]).await?;
        parse_node_list(&stdout)
    }

    async fn volume_state(&self, volume: Uuid) -> Result<VolumeState, ClusterError> {
        let status = self
            .volume(volume)
            .await?
            .status
            .ok_or_else(|| MissingFieldSnafu { volume, field: "status" }.build())?;
        status.state.parse()
    }

    async fn nexus_state(&self, volume: Uuid) -> Result<NexusState, ClusterError> {
        self.nexus(volume).await?.state.parse()
    }

    async fn topology(&self, volume: Uuid) -> Result<VolumeTopology, ClusterError> {
        let status = self.volume(volume).await?.status.unwrap_or_default();
        Ok(VolumeTopology {
            nexus_node: status.nexus.map(|n| n.node).filter(|n| !n.is_empty()),
            replica_nodes: status.replicas.into_iter().map(|r| r.node).collect(),
        })
    }

    async fn children(&self, volume: Uuid) -> Result<Vec<NexusChild>, ClusterError> {
        self.nexus(volume)
            .await?
            .children
            .into_iter()
            .map(|child| -> Result<NexusChild, ClusterError> {
                Ok(NexusChild {
                    state: child.state.parse()?,
                    uri: child.uri,
                })
            })
            .collect()
    }

    async fn replica_count(&self, volume: Uuid) -> Result<u32, ClusterError> {
        Ok(self.volume(volume).await?.spec.replica_count)
    }

    async fn set_replica_count(&self, volume: Uuid, count: u32) -> Result<(), ClusterError> {
        let name = volume.to_string();
        let patch = serde_json::json!({ "spec": { "replicaCount": count } }).to_string();
        let args = [
            "-n",
            self.namespace.as_str(),
            "patch",
            VOLUME_RESOURCE,
            name.as_str(),
            "--type",
            "merge",
            "-p",
            patch.as_str(),
        ];
        self.kubectl(&args).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct NodeList {
    items: Vec<NodeItem>,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    metadata: Metadata,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct MsvResource {
    spec: MsvSpec,
    status: Option<MsvStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsvSpec {
    replica_count: u32,
}

#[derive(Debug, Default, Deserialize)]
struct MsvStatus {
    #[serde(default)]
    state: String,
    nexus: Option<MsvNexus>,
    #[serde(default)]
    replicas: Vec<MsvReplica>,
}

#[derive(Debug, Deserialize)]
struct MsvNexus {
    #[serde(default)]
    node: String,
    state: String,
    #[serde(default)]
    children: Vec<MsvChild>,
}

#[derive(Debug, Deserialize)]
struct MsvChild {
    uri: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct MsvReplica {
    node: String,
}

fn parse_node_list(json: &[u8]) -> Result<Vec<ClusterNode>, ClusterError> {
    let list: NodeList = serde_json::from_slice(json).context(DecodeSnafu { what: "node list" })?;
    list.items
        .into_iter()
        .map(|item| -> Result<ClusterNode, ClusterError> {
            let address = item
                .status
                .addresses
                .iter()
                .find(|a| a.kind == "InternalIP")
                .and_then(|a| a.address.parse::<IpAddr>().ok())
                .ok_or_else(|| ClusterError::NodeAddress {
                    node: item.metadata.name.clone(),
                })?;
            Ok(ClusterNode::new(item.metadata.name, address))
        })
        .collect()
}

fn parse_volume(json: &[u8]) -> Result<MsvResource, ClusterError> {
    serde_json::from_slice(json).context(DecodeSnafu { what: "volume resource" })
}
