//! Node-loss fault injection and convergence checks for replicated
//! nexus volumes.
//!
//! A scenario isolates one replica node of a volume from its peers,
//! watches the control plane mark the volume degraded (and optionally
//! heal it on a spare node), keeps I/O running throughout, and always
//! reconnects the node afterwards.
//!
//! # Modules
//!
//! - [`cluster`]: cluster state queries and the kubectl backend
//! - [`topology`]: choosing the node to isolate and its peers
//! - [`poll`]: bounded polling for state convergence
//! - [`load`]: foreground and background I/O load
//! - [`scenario`]: scenario definitions, orchestration and reports
//! - [`provision`]: volume and workload setup around a run
//! - [`config`]: layered configuration
//! - [`testing`]: the in-memory simulated cluster
//!
//! Network isolation itself lives in the `nexus-chaos-network` crate.

pub mod cluster;
pub mod config;
pub mod error;
pub mod load;
pub mod poll;
pub mod provision;
pub mod scenario;
pub mod testing;
pub mod topology;

pub use cluster::ClusterState;
pub use cluster::KubectlCluster;
pub use config::HarnessConfig;
pub use error::HarnessError;
pub use load::LoadGenerator;
pub use load::Workload;
pub use poll::ConditionPoller;
pub use poll::PollConfig;
pub use provision::Provisioner;
pub use provision::Suite;
pub use scenario::Orchestrator;
pub use scenario::ScenarioKind;
pub use scenario::ScenarioReport;
pub use topology::IsolationTarget;
pub use topology::TopologyResolver;
