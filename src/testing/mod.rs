//! Testing infrastructure.
//!
//! [`SimulatedCluster`] stands in for the storage cluster, the fault
//! control backend, the workload and the provisioner at once, so scenarios
//! can be run end to end without kubectl or root access. It is also what
//! `nexus-chaos run --simulate` runs against.
//!
//! ```ignore
//! let cluster = Arc::new(SimulatedCluster::new(4));
//! let volume = cluster.add_volume("node-1", &["node-1", "node-2"]);
//! let orchestrator = Orchestrator::new(cluster.clone(), cluster.clone(), cluster.clone(), &HarnessConfig::default());
//! orchestrator.run(ScenarioKind::LossWhileIdle, volume).await?;
//! ```

pub mod simulated;

pub use simulated::SimCall;
pub use simulated::SimTiming;
pub use simulated::SimulatedCluster;
