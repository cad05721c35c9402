//! Volume and workload provisioning around a scenario run.
//!
//! Provisioning is owned by an external collaborator; the harness only
//! consumes it through [`Provisioner`]. [`Suite`] brackets a scenario with
//! setup and teardown so that scenario teardown (reconnection) always
//! happens before the volume and pod are released.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use snafu::ResultExt;
use snafu::Snafu;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::ConvergenceSnafu;
use crate::error::HarnessError;
use crate::error::ProvisionSnafu;
use crate::poll::ConditionPoller;
use crate::scenario::Orchestrator;
use crate::scenario::ScenarioKind;
use crate::scenario::ScenarioReport;

/// Creates and deletes the resources a scenario runs against.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a volume claim and return the UUID of the bound volume.
    async fn create_volume_claim(&self, name: &str, storage_class: &str) -> Result<Uuid, ProvisionError>;

    async fn delete_volume_claim(&self, name: &str) -> Result<(), ProvisionError>;

    /// Create the workload pod mounting `claim`.
    async fn create_workload(&self, pod: &str, claim: &str) -> Result<(), ProvisionError>;

    async fn delete_workload(&self, pod: &str) -> Result<(), ProvisionError>;

    async fn workload_ready(&self, pod: &str) -> Result<bool, ProvisionError>;
}

/// Provisioning errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProvisionError {
    #[snafu(display("failed to {operation} {name}: {reason}"))]
    Operation {
        operation: &'static str,
        name: String,
        reason: String,
    },

    #[snafu(display("{kind} {name} not found"))]
    NotFound { kind: &'static str, name: String },
}

/// Names of the resources a suite provisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteResources {
    pub claim: String,
    pub storage_class: String,
    pub pod: String,
}

impl SuiteResources {
    pub fn new(claim: impl Into<String>, storage_class: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            storage_class: storage_class.into(),
            pod: pod.into(),
        }
    }
}

/// A provisioned volume and its workload pod.
pub struct Suite {
    provisioner: Arc<dyn Provisioner>,
    resources: SuiteResources,
    timeouts: TimeoutConfig,
    volume: Option<Uuid>,
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("resources", &self.resources)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl Suite {
    pub fn new(provisioner: Arc<dyn Provisioner>, resources: SuiteResources, timeouts: TimeoutConfig) -> Self {
        Self {
            provisioner,
            resources,
            timeouts,
            volume: None,
        }
    }

    /// UUID of the provisioned volume, once set up.
    pub fn volume(&self) -> Option<Uuid> {
        self.volume
    }

    /// Create the claim and the pod, then wait for the pod to be ready.
    pub async fn setup(&mut self) -> Result<Uuid, HarnessError> {
        let SuiteResources {
            claim,
            storage_class,
            pod,
        } = &self.resources;

        let volume = self
            .provisioner
            .create_volume_claim(claim, storage_class)
            .await
            .context(ProvisionSnafu)?;
        self.volume = Some(volume);
        info!(volume = %volume, claim = %claim, "volume claim created");

        self.provisioner.create_workload(pod, claim).await.context(ProvisionSnafu)?;

        let provisioner = &self.provisioner;
        ConditionPoller::new(self.timeouts.default_poll())
            .wait_for(
                &format!("workload pod {pod} ready"),
                || provisioner.workload_ready(pod),
                |ready| *ready,
            )
            .await
            .context(ConvergenceSnafu)?;

        info!(volume = %volume, pod = %pod, "workload ready");
        Ok(volume)
    }

    /// Delete the pod, then the claim. Both are attempted.
    pub async fn teardown(&mut self) -> Result<(), HarnessError> {
        let mut failures = Vec::new();

        if let Err(e) = self.provisioner.delete_workload(&self.resources.pod).await {
            warn!(pod = %self.resources.pod, error = %e, "failed to delete workload pod");
            failures.push(e);
        }
        if let Err(e) = self.provisioner.delete_volume_claim(&self.resources.claim).await {
            warn!(claim = %self.resources.claim, error = %e, "failed to delete volume claim");
            failures.push(e);
        }
        self.volume = None;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::SuiteTeardown { failures })
        }
    }

    /// Setup, run `scenario`, then teardown.
    ///
    /// A scenario failure takes precedence over a teardown failure.
    pub async fn run(
        &mut self,
        orchestrator: &Orchestrator,
        scenario: ScenarioKind,
    ) -> Result<ScenarioReport, HarnessError> {
        let volume = match self.setup().await {
            Ok(volume) => volume,
            Err(e) => {
                if let Err(teardown) = self.teardown().await {
                    warn!(error = %teardown, "suite teardown failed after setup failure");
                }
                return Err(e);
            }
        };

        let result = orchestrator.run(scenario, volume).await;
        let teardown = self.teardown().await;

        match (result, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!(error = %teardown, "suite teardown failed after scenario failure");
                Err(e)
            }
        }
    }
}
