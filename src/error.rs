//! Top-level harness errors.
//!
//! Failures fall into the classes scenarios care about: preconditions
//! (nothing was injected yet), injection, reconnection, convergence
//! timeouts and workload failures. Scenario runs wrap whichever one
//! occurred in [`HarnessError::StepFailed`] so the report names the step.

use nexus_chaos_network::FaultError;
use snafu::Snafu;
use uuid::Uuid;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::load::LoadError;
use crate::poll::PollError;
use crate::provision::ProvisionError;
use crate::scenario::ScenarioKind;
use crate::scenario::Step;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HarnessError {
    /// The volume is not published, so there is no nexus to protect.
    #[snafu(display("volume {volume} has no nexus node"))]
    NexusNotPublished { volume: Uuid },

    /// Every replica sits on the nexus node.
    #[snafu(display("volume {volume} has no replica outside the nexus node"))]
    NoIsolationCandidate { volume: Uuid },

    /// Placement names a node the node list does not contain.
    #[snafu(display("replica node {node} is not a cluster member"))]
    UnknownNode { node: String },

    /// The target shares its address with every other node.
    #[snafu(display("isolating {target} leaves no peers to disconnect"))]
    NoPeers { target: String },

    /// Fewer peers than the scenario requires.
    #[snafu(display("{scenario} needs at least {required} peer nodes, found {actual}"))]
    InsufficientPeers {
        scenario: ScenarioKind,
        required: usize,
        actual: usize,
    },

    /// The rebuild scenario must start from a single replica.
    #[snafu(display("volume {volume} must have {expected} replica(s) to start, has {actual}"))]
    ReplicaCountPrecondition { volume: Uuid, expected: u32, actual: u32 },

    /// The control plane did not accept the new replica count.
    #[snafu(display("volume {volume} replica count reads back {actual} after setting {expected}"))]
    ReplicaCountMismatch { volume: Uuid, expected: u32, actual: u32 },

    /// A disconnect command failed. Peers cut before it are still reconnected.
    #[snafu(display("failed to isolate node: {source}"))]
    Injection { source: FaultError },

    /// Checked reconnect left at least one peer isolated.
    #[snafu(display("failed to reconnect node: {source}"))]
    Reconnect { source: FaultError },

    /// A poll timed out or its producer failed.
    #[snafu(display("{source}"))]
    Convergence { source: PollError },

    #[snafu(display("cluster query failed: {source}"))]
    Cluster { source: ClusterError },

    /// A foreground workload run failed.
    #[snafu(display("load failed: {source}"))]
    Workload { source: LoadError },

    /// The joined background workload failed or overran its budget.
    #[snafu(display("background load failed: {source}"))]
    BackgroundLoad { source: LoadError },

    #[snafu(display("configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("provisioning failed: {source}"))]
    Provision { source: ProvisionError },

    /// One or more suite resources could not be deleted.
    #[snafu(display(
        "suite teardown failed: {}",
        failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    ))]
    SuiteTeardown { failures: Vec<ProvisionError> },

    /// A scenario name that matches no [`ScenarioKind`].
    #[snafu(display("unknown scenario '{name}' (expected one of: {known})"))]
    UnknownScenario { name: String, known: String },

    /// The run was interrupted by a shutdown request.
    #[snafu(display("{scenario} interrupted by shutdown"))]
    Interrupted { scenario: ScenarioKind },

    /// Wraps any failure with the scenario and step it occurred in.
    #[snafu(display("{scenario} failed at step {step}: {source}"))]
    StepFailed {
        scenario: ScenarioKind,
        step: Step,
        #[snafu(source(from(HarnessError, Box::new)))]
        source: Box<HarnessError>,
    },
}

impl HarnessError {
    /// True for failures raised before any fault was injected.
    pub fn is_precondition(&self) -> bool {
        match self {
            HarnessError::NexusNotPublished { .. }
            | HarnessError::NoIsolationCandidate { .. }
            | HarnessError::UnknownNode { .. }
            | HarnessError::NoPeers { .. }
            | HarnessError::InsufficientPeers { .. }
            | HarnessError::ReplicaCountPrecondition { .. } => true,
            HarnessError::StepFailed { source, .. } => source.is_precondition(),
            _ => false,
        }
    }

    /// The step a scenario failed at, if this came from a scenario run.
    pub fn failed_step(&self) -> Option<Step> {
        match self {
            HarnessError::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The underlying error with step wrapping removed.
    pub fn root(&self) -> &HarnessError {
        match self {
            HarnessError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_precondition_classification_sees_through_steps() {
        let inner = HarnessError::InsufficientPeers {
            scenario: ScenarioKind::LossWithReassignment,
            required: 3,
            actual: 2,
        };
        assert!(inner.is_precondition());

        let wrapped = HarnessError::StepFailed {
            scenario: ScenarioKind::LossWithReassignment,
            step: Step::CheckPeers,
            source: Box::new(inner),
        };
        assert!(wrapped.is_precondition());
        assert_eq!(wrapped.failed_step(), Some(Step::CheckPeers));
        assert!(matches!(wrapped.root(), HarnessError::InsufficientPeers { .. }));
    }

    #[test]
    fn test_convergence_timeout_message_names_last_state() {
        let err = HarnessError::StepFailed {
            scenario: ScenarioKind::LossWhileIdle,
            step: Step::WaitDegraded,
            source: Box::new(HarnessError::Convergence {
                source: PollError::Timeout {
                    what: "volume state == degraded".into(),
                    timeout: Duration::from_secs(90),
                    attempts: 91,
                    last_observed: Some("healthy".into()),
                },
            }),
        };

        assert!(!err.is_precondition());
        let message = err.to_string();
        assert!(message.contains("loss-while-idle failed at step wait-degraded"), "{message}");
        assert!(message.contains("last observed: healthy"), "{message}");
    }
}
