//! Scenario orchestration.
//!
//! The orchestrator resolves the target once, then drives the scenario's
//! steps in order. Any failed step aborts the run; the isolation is always
//! torn down afterwards, reconnecting every peer in scope with failures
//! tolerated so the original error stays the reported cause.
//!
//! Cancelling the orchestrator's shutdown token interrupts the step in
//! progress and takes the same teardown path. Isolations dropped without
//! teardown (an aborted `run` future) reconnect on a tracked task that
//! [`Orchestrator::wait_for_cleanup`] drains.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nexus_chaos_network::FaultControl;
use nexus_chaos_network::Isolation;
use nexus_chaos_network::IsolationMethod;
use nexus_chaos_network::NodeIsolator;
use nexus_chaos_network::ReconnectMode;
use snafu::ResultExt;
use snafu::ensure;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use super::BackgroundLoadOutcome;
use super::ScenarioContext;
use super::ScenarioKind;
use super::ScenarioReport;
use super::Step;
use super::StepRecord;
use super::report::TeardownSummary;
use crate::cluster::ChildState;
use crate::cluster::ClusterState;
use crate::cluster::NexusState;
use crate::cluster::VolumeState;
use crate::config::HarnessConfig;
use crate::config::TimeoutConfig;
use crate::error::BackgroundLoadSnafu;
use crate::error::ClusterSnafu;
use crate::error::ConvergenceSnafu;
use crate::error::HarnessError;
use crate::error::InjectionSnafu;
use crate::error::InsufficientPeersSnafu;
use crate::error::InterruptedSnafu;
use crate::error::ReconnectSnafu;
use crate::error::ReplicaCountMismatchSnafu;
use crate::error::ReplicaCountPreconditionSnafu;
use crate::error::StepFailedSnafu;
use crate::error::WorkloadSnafu;
use crate::load::BackgroundPolicy;
use crate::load::LoadGenerator;
use crate::load::LoadHandle;
use crate::load::Workload;
use crate::poll::ConditionPoller;
use crate::topology::IsolationTarget;
use crate::topology::TopologyResolver;

/// Replica count the rebuild scenario starts from and grows to.
const REBUILD_FROM: u32 = 1;
const REBUILD_TO: u32 = 2;

/// Runs scenarios against one cluster.
pub struct Orchestrator {
    cluster: Arc<dyn ClusterState>,
    resolver: TopologyResolver,
    isolator: NodeIsolator,
    load: LoadGenerator,
    timeouts: TimeoutConfig,
    settle_delay: Duration,
    method: IsolationMethod,
    background: BackgroundPolicy,
    min_peers: Option<usize>,
    shutdown: CancellationToken,
    cleanup: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        control: Arc<dyn FaultControl>,
        workload: Arc<dyn Workload>,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            resolver: TopologyResolver::new(cluster.clone()),
            cluster,
            isolator: NodeIsolator::new(control),
            load: LoadGenerator::new(workload, config.load.duration),
            timeouts: config.timeouts.clone(),
            settle_delay: config.settle_delay,
            method: config.isolation_method,
            background: config.load.background,
            min_peers: config.min_peers,
            shutdown: CancellationToken::new(),
            cleanup: TaskTracker::new(),
        }
    }

    /// Use `token` to interrupt running scenarios.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Token that interrupts running scenarios when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn resolver(&self) -> &TopologyResolver {
        &self.resolver
    }

    /// Wait for reconnects scheduled by isolations that were dropped
    /// without teardown. Call before the runtime shuts down.
    pub async fn wait_for_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }

    /// Peer minimum for `scenario`. The configured override can raise the
    /// scenario's own minimum but never lower it.
    fn required_peers(&self, scenario: ScenarioKind) -> usize {
        let floor = scenario.min_peers();
        match self.min_peers {
            Some(min) if min < floor => {
                warn!(scenario = %scenario, min_peers = min, floor, "min_peers below scenario minimum, ignored");
                floor
            }
            Some(min) => min,
            None => floor,
        }
    }

    /// Run `scenario` against `volume`.
    ///
    /// On failure the error is a [`HarnessError::StepFailed`] naming the
    /// step, or [`HarnessError::Interrupted`] when the shutdown token fired
    /// between steps. Teardown has already run by the time this returns.
    pub async fn run(&self, scenario: ScenarioKind, volume: Uuid) -> Result<ScenarioReport, HarnessError> {
        let start = Instant::now();
        let mut recorder = StepRecorder::new(scenario, volume);
        info!(scenario = %scenario, volume = %volume, "starting scenario");

        let outcome = if scenario.injects_fault() {
            self.run_loss(scenario, volume, &mut recorder).await
        } else {
            let ctx = self.context(scenario, volume, None);
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(()),
                result = self.drive_rebuild(&ctx, &mut recorder) => Ok(result),
            };
            match result {
                Ok(result) => result.map(|()| RunOutcome::default()),
                Err(()) => Err(recorder.interrupted()),
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(outcome) => {
                info!(scenario = %scenario, volume = %volume, elapsed_ms, "scenario passed");
                Ok(ScenarioReport {
                    scenario,
                    volume,
                    method: outcome.target.as_ref().map(|_| self.method),
                    target: outcome.target,
                    steps: recorder.steps,
                    background_load: outcome.background_load,
                    teardown: outcome.teardown,
                    elapsed_ms,
                })
            }
            Err(e) => {
                warn!(scenario = %scenario, volume = %volume, elapsed_ms, error = %e, "scenario failed");
                Err(e)
            }
        }
    }

    fn context(&self, scenario: ScenarioKind, volume: Uuid, target: Option<IsolationTarget>) -> ScenarioContext {
        ScenarioContext {
            scenario,
            volume,
            target,
            method: self.method,
            timeouts: self.timeouts.clone(),
            settle_delay: self.settle_delay,
        }
    }

    async fn run_loss(
        &self,
        scenario: ScenarioKind,
        volume: Uuid,
        recorder: &mut StepRecorder,
    ) -> Result<RunOutcome, HarnessError> {
        let target = recorder.run(Step::ResolveTarget, self.resolver.resolve(volume)).await?;

        let required = self.required_peers(scenario);
        let actual = target.peers.len();
        recorder
            .run(Step::CheckPeers, async {
                ensure!(
                    actual >= required,
                    InsufficientPeersSnafu {
                        scenario,
                        required,
                        actual
                    }
                );
                Ok::<_, HarnessError>(())
            })
            .await?;

        let ctx = self.context(scenario, volume, Some(target.clone()));
        let mut isolation = Isolation::new(self.isolator.clone(), target.node.clone(), target.peers.clone(), ctx.method)
            .with_tracker(self.cleanup.clone());
        let mut background = None;

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(()),
            result = self.drive_loss(&ctx, &mut isolation, &mut background, recorder) => Ok(result),
        };
        let result = match result {
            Ok(result) => result,
            Err(()) => {
                warn!(scenario = %scenario, target_node = %target.node, "scenario interrupted, tearing down");
                Err(recorder.interrupted())
            }
        };

        // stop I/O before the node rejoins
        if result.is_err() {
            if let Some(handle) = background.take() {
                let outcome = handle.stop().await;
                debug!(scenario = %scenario, outcome = ?outcome.err(), "background load stopped");
            }
        }

        let teardown = isolation.teardown().await;
        debug!(
            scenario = %scenario,
            target_node = %target.node,
            reconnected = teardown.reconnected.len(),
            failed = teardown.failed.len(),
            "isolation torn down"
        );

        result?;

        let background_load = self.settle_background(&ctx, background.take(), recorder).await?;
        Ok(RunOutcome {
            target: Some(target),
            background_load,
            teardown: Some(TeardownSummary::from(teardown)),
        })
    }

    async fn drive_loss(
        &self,
        ctx: &ScenarioContext,
        isolation: &mut Isolation,
        background: &mut Option<LoadHandle>,
        recorder: &mut StepRecorder,
    ) -> Result<(), HarnessError> {
        let cluster = &*self.cluster;
        let volume = ctx.volume;

        if ctx.scenario.uses_background_load() {
            let handle = recorder
                .run(Step::StartBackgroundLoad, async { Ok(self.load.spawn_background()) })
                .await?;
            *background = Some(handle);

            recorder
                .run(Step::SettleDelay, async {
                    tokio::time::sleep(ctx.settle_delay).await;
                    Ok(())
                })
                .await?;
        }

        recorder
            .run(Step::Disconnect, async { isolation.disconnect().await.context(InjectionSnafu) })
            .await?;
        info!(
            volume = %volume,
            target_node = %isolation.target(),
            method = %ctx.method,
            peers = isolation.peers().len(),
            "node isolated"
        );

        let disconnection = ConditionPoller::new(ctx.timeouts.disconnection_poll());
        recorder
            .run(Step::WaitDegraded, async {
                disconnection
                    .volume_state(cluster, volume, VolumeState::Degraded)
                    .await
                    .context(ConvergenceSnafu)
            })
            .await?;

        if ctx.scenario == ScenarioKind::LossWithReassignment {
            let repair = ConditionPoller::new(ctx.timeouts.repair_poll());
            recorder
                .run(Step::WaitHealthy, async {
                    repair
                        .volume_state(cluster, volume, VolumeState::Healthy)
                        .await
                        .context(ConvergenceSnafu)
                })
                .await?;
        }

        recorder
            .run(Step::LoadWhileDisconnected, async { self.load.run_foreground().await.context(WorkloadSnafu) })
            .await?;

        recorder
            .run(Step::Reconnect, async {
                isolation.reconnect(ReconnectMode::Checked).await.map(|_| ()).context(ReconnectSnafu)
            })
            .await?;
        info!(volume = %volume, target_node = %isolation.target(), "node reconnected");

        recorder
            .run(Step::LoadAfterReconnect, async { self.load.run_foreground().await.context(WorkloadSnafu) })
            .await
    }

    async fn settle_background(
        &self,
        ctx: &ScenarioContext,
        handle: Option<LoadHandle>,
        recorder: &mut StepRecorder,
    ) -> Result<BackgroundLoadOutcome, HarnessError> {
        let Some(handle) = handle else {
            return Ok(BackgroundLoadOutcome::NotStarted);
        };

        match self.background {
            BackgroundPolicy::Join => {
                let budget = self.load.duration() + ctx.timeouts.default;
                recorder
                    .run(Step::BackgroundLoad, async { handle.finish(budget).await.context(BackgroundLoadSnafu) })
                    .await?;
                Ok(BackgroundLoadOutcome::Completed)
            }
            BackgroundPolicy::Detached => Ok(match handle.try_finish().await {
                Some(Ok(())) => BackgroundLoadOutcome::Completed,
                Some(Err(e)) => {
                    warn!(scenario = %ctx.scenario, error = %e, "background load failed");
                    BackgroundLoadOutcome::Failed { error: e.to_string() }
                }
                None => {
                    info!(scenario = %ctx.scenario, "background load still running, cancelled");
                    BackgroundLoadOutcome::Cancelled
                }
            }),
        }
    }

    async fn drive_rebuild(&self, ctx: &ScenarioContext, recorder: &mut StepRecorder) -> Result<(), HarnessError> {
        let cluster = &*self.cluster;
        let volume = ctx.volume;

        recorder
            .run(Step::CheckReplicaCount, async {
                let actual = cluster.replica_count(volume).await.context(ClusterSnafu)?;
                ensure!(
                    actual == REBUILD_FROM,
                    ReplicaCountPreconditionSnafu {
                        volume,
                        expected: REBUILD_FROM,
                        actual
                    }
                );
                Ok::<_, HarnessError>(())
            })
            .await?;

        recorder
            .run(Step::SetReplicaCount, async {
                cluster.set_replica_count(volume, REBUILD_TO).await.context(ClusterSnafu)
            })
            .await?;
        info!(volume = %volume, replicas = REBUILD_TO, "replica count raised");

        recorder
            .run(Step::ConfirmReplicaCount, async {
                let actual = cluster.replica_count(volume).await.context(ClusterSnafu)?;
                ensure!(
                    actual == REBUILD_TO,
                    ReplicaCountMismatchSnafu {
                        volume,
                        expected: REBUILD_TO,
                        actual
                    }
                );
                Ok::<_, HarnessError>(())
            })
            .await?;

        let poller = ConditionPoller::new(ctx.timeouts.default_poll());
        let children = REBUILD_TO as usize;

        recorder
            .run(Step::WaitChildCount, async {
                poller.child_count(cluster, volume, children).await.context(ConvergenceSnafu)
            })
            .await?;
        recorder
            .run(Step::WaitNewChildDegraded, async {
                poller
                    .child_state(cluster, volume, children, 1, ChildState::Degraded)
                    .await
                    .context(ConvergenceSnafu)
            })
            .await?;
        recorder
            .run(Step::WaitNexusDegraded, async {
                poller.nexus_state(cluster, volume, NexusState::Degraded).await.context(ConvergenceSnafu)
            })
            .await?;
        recorder
            .run(Step::WaitFirstChildOnline, async {
                poller
                    .child_state(cluster, volume, children, 0, ChildState::Online)
                    .await
                    .context(ConvergenceSnafu)
            })
            .await?;
        recorder
            .run(Step::WaitNewChildOnline, async {
                poller
                    .child_state(cluster, volume, children, 1, ChildState::Online)
                    .await
                    .context(ConvergenceSnafu)
            })
            .await?;
        recorder
            .run(Step::WaitNexusOnline, async {
                poller.nexus_state(cluster, volume, NexusState::Online).await.context(ConvergenceSnafu)
            })
            .await?;

        info!(volume = %volume, "rebuild converged");
        Ok(())
    }
}

#[derive(Default)]
struct RunOutcome {
    target: Option<IsolationTarget>,
    background_load: BackgroundLoadOutcome,
    teardown: Option<TeardownSummary>,
}

/// Times each step and tags failures with the step that produced them.
struct StepRecorder {
    scenario: ScenarioKind,
    volume: Uuid,
    steps: Vec<StepRecord>,
    current: Option<(Step, Instant)>,
}

impl StepRecorder {
    fn new(scenario: ScenarioKind, volume: Uuid) -> Self {
        Self {
            scenario,
            volume,
            steps: Vec::new(),
            current: None,
        }
    }

    /// Close out the step in progress as interrupted.
    fn interrupted(&mut self) -> HarnessError {
        let err = InterruptedSnafu { scenario: self.scenario }.build();
        match self.current.take() {
            Some((step, start)) => {
                self.steps.push(StepRecord {
                    step,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    ok: false,
                });
                warn!(scenario = %self.scenario, step = %step, "step interrupted");
                HarnessError::StepFailed {
                    scenario: self.scenario,
                    step,
                    source: Box::new(err),
                }
            }
            None => err,
        }
    }

    async fn run<T, F>(&mut self, step: Step, fut: F) -> Result<T, HarnessError>
    where
        F: Future<Output = Result<T, HarnessError>>,
    {
        let start = Instant::now();
        debug!(scenario = %self.scenario, volume = %self.volume, step = %step, "step started");
        self.current = Some((step, start));

        let result = fut.await;
        self.current = None;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.steps.push(StepRecord {
            step,
            elapsed_ms,
            ok: result.is_ok(),
        });

        match &result {
            Ok(_) => info!(scenario = %self.scenario, step = %step, elapsed_ms, "step passed"),
            Err(e) => warn!(scenario = %self.scenario, step = %step, elapsed_ms, error = %e, "step failed"),
        }
        result.context(StepFailedSnafu {
            scenario: self.scenario,
            step,
        })
    }
}
