//! Fault-tolerance scenarios.
//!
//! Each [`ScenarioKind`] is a fixed sequence of [`Step`]s run by the
//! [`Orchestrator`]. The loss scenarios isolate the first non-nexus replica
//! node and check that the volume degrades, optionally heals, and keeps
//! serving I/O. The rebuild scenario grows the volume from one replica to
//! two and follows the new child through its rebuild.

pub mod orchestrator;
pub mod report;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use nexus_chaos_network::IsolationMethod;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::HarnessError;
use crate::error::UnknownScenarioSnafu;
use crate::topology::IsolationTarget;

pub use orchestrator::Orchestrator;
pub use report::BackgroundLoadOutcome;
pub use report::ScenarioReport;
pub use report::StepRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Node loss while background I/O is running.
    LossWhileActive,
    /// Node loss with no I/O in flight.
    LossWhileIdle,
    /// Node loss followed by replacement of the lost replica on a spare node.
    LossWithReassignment,
    /// Replica count 1 -> 2 and rebuild of the new child.
    ReplicaRebuild,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 4] = [
        ScenarioKind::LossWhileActive,
        ScenarioKind::LossWhileIdle,
        ScenarioKind::LossWithReassignment,
        ScenarioKind::ReplicaRebuild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::LossWhileActive => "loss-while-active",
            ScenarioKind::LossWhileIdle => "loss-while-idle",
            ScenarioKind::LossWithReassignment => "loss-with-reassignment",
            ScenarioKind::ReplicaRebuild => "replica-rebuild",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioKind::LossWhileActive => "isolate a replica node under load; volume degrades and I/O continues",
            ScenarioKind::LossWhileIdle => "isolate a replica node with no load; degraded volume stays usable",
            ScenarioKind::LossWithReassignment => {
                "isolate a replica node; replica moves to a spare node and volume heals"
            }
            ScenarioKind::ReplicaRebuild => "grow replica count 1 -> 2; new child rebuilds and comes online",
        }
    }

    /// Minimum number of peers the isolated node must have.
    ///
    /// Reassignment needs a spare node besides the nexus node and the
    /// remaining replicas.
    pub fn min_peers(&self) -> usize {
        match self {
            ScenarioKind::LossWhileActive | ScenarioKind::LossWhileIdle => 1,
            ScenarioKind::LossWithReassignment => 3,
            ScenarioKind::ReplicaRebuild => 0,
        }
    }

    pub fn injects_fault(&self) -> bool {
        !matches!(self, ScenarioKind::ReplicaRebuild)
    }

    pub fn uses_background_load(&self) -> bool {
        matches!(self, ScenarioKind::LossWhileActive | ScenarioKind::LossWithReassignment)
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('_', "-");
        match ScenarioKind::ALL.into_iter().find(|kind| kind.as_str() == name) {
            Some(kind) => Ok(kind),
            None => {
                let known: Vec<_> = ScenarioKind::ALL.iter().map(|k| k.as_str()).collect();
                UnknownScenarioSnafu {
                    name: s.trim(),
                    known: known.join(", "),
                }
                .fail()
            }
        }
    }
}

/// One step of a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    ResolveTarget,
    CheckPeers,
    StartBackgroundLoad,
    SettleDelay,
    Disconnect,
    WaitDegraded,
    WaitHealthy,
    LoadWhileDisconnected,
    Reconnect,
    LoadAfterReconnect,
    BackgroundLoad,
    CheckReplicaCount,
    SetReplicaCount,
    ConfirmReplicaCount,
    WaitChildCount,
    WaitNewChildDegraded,
    WaitNexusDegraded,
    WaitFirstChildOnline,
    WaitNewChildOnline,
    WaitNexusOnline,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ResolveTarget => "resolve-target",
            Step::CheckPeers => "check-peers",
            Step::StartBackgroundLoad => "start-background-load",
            Step::SettleDelay => "settle-delay",
            Step::Disconnect => "disconnect",
            Step::WaitDegraded => "wait-degraded",
            Step::WaitHealthy => "wait-healthy",
            Step::LoadWhileDisconnected => "load-while-disconnected",
            Step::Reconnect => "reconnect",
            Step::LoadAfterReconnect => "load-after-reconnect",
            Step::BackgroundLoad => "background-load",
            Step::CheckReplicaCount => "check-replica-count",
            Step::SetReplicaCount => "set-replica-count",
            Step::ConfirmReplicaCount => "confirm-replica-count",
            Step::WaitChildCount => "wait-child-count",
            Step::WaitNewChildDegraded => "wait-new-child-degraded",
            Step::WaitNexusDegraded => "wait-nexus-degraded",
            Step::WaitFirstChildOnline => "wait-first-child-online",
            Step::WaitNewChildOnline => "wait-new-child-online",
            Step::WaitNexusOnline => "wait-nexus-online",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a scenario run needs, resolved once and threaded through
/// every step.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub scenario: ScenarioKind,
    pub volume: Uuid,
    /// `None` for scenarios that inject no fault.
    pub target: Option<IsolationTarget>,
    pub method: IsolationMethod,
    pub timeouts: TimeoutConfig,
    pub settle_delay: Duration,
}
