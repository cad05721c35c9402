//! Shared fixtures for the integration tests.
//!
//! Every test runs against a [`SimulatedCluster`] under a paused tokio
//! clock, so the control plane delays below play out in virtual time.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nexus_chaos::HarnessConfig;
use nexus_chaos::Orchestrator;
use nexus_chaos::testing::SimulatedCluster;
use uuid::Uuid;

/// Install a test subscriber once. Repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Defaults with short load runs and settle delay.
pub fn fast_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.settle_delay = Duration::from_secs(1);
    config.load.duration = Duration::from_secs(2);
    config
}

/// A simulated cluster, the orchestrator driving it and one two-replica
/// volume with its nexus on `node-1` and the second replica on `node-2`.
pub struct Fixture {
    pub cluster: Arc<SimulatedCluster>,
    pub orchestrator: Orchestrator,
    pub volume: Uuid,
}

impl Fixture {
    pub fn new(nodes: usize, config: &HarnessConfig) -> Self {
        Self::with_replicas(nodes, &["node-1", "node-2"], config)
    }

    pub fn with_replicas(nodes: usize, replicas: &[&str], config: &HarnessConfig) -> Self {
        init_tracing();
        let cluster = Arc::new(SimulatedCluster::new(nodes));
        let volume = cluster.add_volume("node-1", replicas);
        Self::around(cluster, volume, config)
    }

    /// Build the orchestrator around a cluster the caller already set up.
    pub fn around(cluster: Arc<SimulatedCluster>, volume: Uuid, config: &HarnessConfig) -> Self {
        let orchestrator = Orchestrator::new(cluster.clone(), cluster.clone(), cluster.clone(), config);
        Self {
            cluster,
            orchestrator,
            volume,
        }
    }
}
