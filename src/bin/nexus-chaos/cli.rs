//! CLI argument definitions and command dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use nexus_chaos::ClusterState;
use nexus_chaos::HarnessConfig;
use nexus_chaos::KubectlCluster;
use nexus_chaos::Orchestrator;
use nexus_chaos::ScenarioKind;
use nexus_chaos::TopologyResolver;
use nexus_chaos::config::FaultControlConfig;
use nexus_chaos::config::parse_duration;
use nexus_chaos::load::BackgroundPolicy;
use nexus_chaos::load::fio::FioWorkload;
use nexus_chaos::testing::SimulatedCluster;
use nexus_chaos_network::FaultControl;
use nexus_chaos_network::IptablesFaultControl;
use nexus_chaos_network::IsolationMethod;
use nexus_chaos_network::NodeIsolator;
use nexus_chaos_network::ReconnectMode;
use nexus_chaos_network::ScriptFaultControl;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::output::FailureOutput;
use crate::output::ReconnectOutput;
use crate::output::ScenarioListOutput;
use crate::output::print_output;

/// Nodes in the cluster built by `--simulate`.
const SIMULATED_NODES: usize = 4;

/// Node-loss scenarios against replicated nexus volumes.
#[derive(Parser)]
#[command(name = "nexus-chaos")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Clone)]
pub struct GlobalOptions {
    /// Configuration file (TOML). Environment variables prefixed with
    /// NEXUS_CHAOS_ override it.
    #[arg(long, short = 'c', env = "NEXUS_CHAOS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format.
    #[arg(long = "json", global = true)]
    pub is_json: bool,

    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub is_verbose: bool,

    /// Disable logging.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub is_quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario against a volume.
    Run(RunArgs),

    /// Reconnect a node to its peers, tolerating failures.
    ///
    /// Use after an interrupted run left a node isolated.
    Reconnect(ReconnectArgs),

    /// Show which node a scenario would isolate and its peers.
    Resolve(ResolveArgs),

    /// List the available scenarios.
    List,
}

#[derive(Args)]
pub struct RunArgs {
    /// Scenario to run (see `list`).
    pub scenario: ScenarioKind,

    /// Volume UUID. Required unless --simulate is given.
    #[arg(long)]
    pub volume: Option<Uuid>,

    /// Run against an in-memory simulated cluster.
    #[arg(long)]
    pub simulate: bool,

    /// How peers observe the isolation: reject or drop.
    #[arg(long)]
    pub method: Option<IsolationMethod>,

    /// Default wait budget, e.g. 90s or 2m.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Budget for the volume to report degraded.
    #[arg(long, value_parser = parse_duration)]
    pub disconnection_timeout: Option<Duration>,

    /// Budget for the volume to heal after reassignment.
    #[arg(long, value_parser = parse_duration)]
    pub repair_timeout: Option<Duration>,

    /// Duration of each workload run.
    #[arg(long, value_parser = parse_duration)]
    pub load_duration: Option<Duration>,

    /// join or detached.
    #[arg(long)]
    pub background: Option<BackgroundPolicy>,
}

#[derive(Args)]
pub struct ReconnectArgs {
    /// Node to reconnect.
    #[arg(long)]
    pub node: String,

    /// Peer addresses, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    pub peers: Vec<String>,

    #[arg(long)]
    pub method: Option<IsolationMethod>,
}

#[derive(Args)]
pub struct ResolveArgs {
    /// Volume UUID.
    #[arg(long)]
    pub volume: Uuid,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let json = self.global.is_json;

        match self.command {
            Commands::List => {
                print_output(&ScenarioListOutput, json);
                Ok(())
            }
            Commands::Run(args) => {
                let config = load_config(&self.global)?;
                args.run(config, json).await
            }
            Commands::Reconnect(args) => {
                let config = load_config(&self.global)?;
                args.run(config, json).await
            }
            Commands::Resolve(args) => {
                let config = load_config(&self.global)?;
                args.run(config, json).await
            }
        }
    }
}

fn load_config(global: &GlobalOptions) -> Result<HarnessConfig> {
    let config = HarnessConfig::load(global.config.as_deref()).context("failed to load configuration")?;
    Ok(config)
}

fn kubectl_cluster(config: &HarnessConfig) -> KubectlCluster {
    KubectlCluster::new(
        config.kubectl.binary.clone(),
        config.kubectl.namespace.clone(),
        config.kubectl.kubeconfig.clone(),
    )
}

fn fault_control(config: &HarnessConfig) -> Arc<dyn FaultControl> {
    match &config.fault_control {
        FaultControlConfig::Script { path, working_dir } => {
            Arc::new(ScriptFaultControl::new(path.clone(), working_dir.clone()))
        }
        FaultControlConfig::Iptables { ssh_user, sudo } => Arc::new(IptablesFaultControl::new(ssh_user.clone(), *sudo)),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

impl RunArgs {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(method) = self.method {
            config.isolation_method = method;
        }
        if let Some(timeout) = self.timeout {
            config.timeouts.default = timeout;
        }
        if let Some(timeout) = self.disconnection_timeout {
            config.timeouts.disconnection = timeout;
        }
        if let Some(timeout) = self.repair_timeout {
            config.timeouts.repair = timeout;
        }
        if let Some(duration) = self.load_duration {
            config.load.duration = duration;
        }
        if let Some(policy) = self.background {
            config.load.background = policy;
        }
    }

    async fn run(self, mut config: HarnessConfig, json: bool) -> Result<()> {
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;

        let scenario = self.scenario;
        let (orchestrator, volume) = if self.simulate {
            let cluster = Arc::new(SimulatedCluster::new(SIMULATED_NODES));
            let volume = self.volume.unwrap_or_else(Uuid::new_v4);
            let replicas: &[&str] = match scenario {
                ScenarioKind::ReplicaRebuild => &["node-1"],
                _ => &["node-1", "node-2"],
            };
            cluster.add_volume_with_id(volume, "node-1", replicas);
            info!(volume = %volume, nodes = SIMULATED_NODES, "running against simulated cluster");
            (Orchestrator::new(cluster.clone(), cluster.clone(), cluster, &config), volume)
        } else {
            let volume = self.volume.context("--volume is required unless --simulate is given")?;
            let workload = FioWorkload::new(
                config.kubectl.binary.clone(),
                config.kubectl.workload_namespace.clone(),
                config.kubectl.workload_pod.clone(),
            )
            .with_kubeconfig(config.kubectl.kubeconfig.clone());
            let cluster = Arc::new(kubectl_cluster(&config));
            let orchestrator = Orchestrator::new(cluster, fault_control(&config), Arc::new(workload), &config);
            (orchestrator, volume)
        };

        let shutdown = orchestrator.shutdown_token();
        let run = orchestrator.run(scenario, volume);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            _ = shutdown_signal() => {
                warn!(scenario = %scenario, "shutdown requested, interrupting scenario");
                shutdown.cancel();
                run.await
            }
        };
        orchestrator.wait_for_cleanup().await;

        match result {
            Ok(report) => {
                print_output(&report, json);
                Ok(())
            }
            Err(e) => {
                if json {
                    print_output(&FailureOutput::new(scenario, volume, &e), json);
                }
                Err(anyhow::Error::new(e).context(format!("scenario {scenario} failed")))
            }
        }
    }
}

impl ReconnectArgs {
    async fn run(self, config: HarnessConfig, json: bool) -> Result<()> {
        let method = self.method.unwrap_or(config.isolation_method);
        let isolator = NodeIsolator::new(fault_control(&config));
        let report = isolator
            .reconnect(&self.node, &self.peers, method, ReconnectMode::Tolerant)
            .await
            .context("reconnect failed")?;

        let complete = report.is_complete();
        print_output(
            &ReconnectOutput {
                node: self.node.clone(),
                report,
            },
            json,
        );
        anyhow::ensure!(complete, "node {} still isolated from some peers", self.node);
        Ok(())
    }
}

impl ResolveArgs {
    async fn run(self, config: HarnessConfig, json: bool) -> Result<()> {
        let cluster: Arc<dyn ClusterState> = Arc::new(kubectl_cluster(&config));
        let target = TopologyResolver::new(cluster)
            .resolve(self.volume)
            .await
            .with_context(|| format!("failed to resolve isolation target for volume {}", self.volume))?;
        print_output(&target, json);
        Ok(())
    }
}
