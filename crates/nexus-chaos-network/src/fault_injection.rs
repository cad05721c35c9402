//! Fault control for node isolation.
//!
//! A fault is a single edge between the node under test and one peer
//! address. Fault control applies or removes that edge; it never decides
//! which edges exist. That is the job of [`crate::isolation`].
//!
//! Two backends are provided:
//!
//! - [`ScriptFaultControl`]: delegates to an external script taking
//!   `<target> <peer> <DISCONNECT|RECONNECT> <METHOD>`. Only the exit status
//!   is interpreted.
//! - [`IptablesFaultControl`]: runs iptables on the target node over ssh.
//!   Every rule is checked with `-C` first so that applying the same state
//!   twice is a no-op.
//!
//! # Example
//!
//! ```ignore
//! use nexus_chaos_network::{FaultAction, FaultControl, IsolationMethod, ScriptFaultControl};
//!
//! let control = ScriptFaultControl::new("../lib/io_connect_node.sh", "./");
//! control.apply("node-2", "10.1.0.3", FaultAction::Disconnect, IsolationMethod::Reject).await?;
//! ```

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::process::Command;
use tracing::debug;

/// How traffic between the isolated node and a peer is cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum IsolationMethod {
    /// Peers see connection refusals.
    #[default]
    Reject,
    /// Peers see timeouts.
    Drop,
}

impl IsolationMethod {
    /// Name passed verbatim to fault control backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMethod::Reject => "REJECT",
            IsolationMethod::Drop => "DROP",
        }
    }
}

impl fmt::Display for IsolationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMethod {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REJECT" => Ok(IsolationMethod::Reject),
            "DROP" => Ok(IsolationMethod::Drop),
            _ => InvalidMethodSnafu { name: s.to_string() }.fail(),
        }
    }
}

/// Whether an edge is being applied or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultAction {
    Disconnect,
    Reconnect,
}

impl FaultAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultAction::Disconnect => "DISCONNECT",
            FaultAction::Reconnect => "RECONNECT",
        }
    }
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies or removes a single isolation edge.
///
/// Implementations must be idempotent: disconnecting an already
/// disconnected peer, or reconnecting a peer that was never isolated,
/// succeeds without changing anything.
#[async_trait]
pub trait FaultControl: Send + Sync {
    async fn apply(
        &self,
        target: &str,
        peer: &str,
        action: FaultAction,
        method: IsolationMethod,
    ) -> Result<(), FaultError>;
}

/// Fault control through an external script.
///
/// The script is invoked as `bash <script> <target> <peer> <ACTION> <METHOD>`
/// from `working_dir`. Its output is captured but never parsed.
#[derive(Debug, Clone)]
pub struct ScriptFaultControl {
    script: PathBuf,
    working_dir: PathBuf,
}

impl ScriptFaultControl {
    pub fn new(script: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

#[async_trait]
impl FaultControl for ScriptFaultControl {
    async fn apply(
        &self,
        target: &str,
        peer: &str,
        action: FaultAction,
        method: IsolationMethod,
    ) -> Result<(), FaultError> {
        let script = self.script.to_string_lossy();
        let args = [&*script, target, peer, action.as_str(), method.as_str()];
        let mut cmd = Command::new("bash");
        cmd.args(args).current_dir(&self.working_dir);
        run_checked(cmd, "bash", &args).await.map(|_| ())
    }
}

/// Fault control by editing iptables on the target node over ssh.
///
/// Disconnecting a peer installs an INPUT rule matching `-s <peer>` and an
/// OUTPUT rule matching `-d <peer>`, both jumping to `REJECT` or `DROP`.
/// Reconnecting deletes those rules for as long as they are present.
#[derive(Debug, Clone)]
pub struct IptablesFaultControl {
    ssh_user: Option<String>,
    use_sudo: bool,
    ssh: PathBuf,
}

/// Upper bound on duplicate rule deletions for a single edge.
const MAX_RULE_DELETIONS: u32 = 16;

impl IptablesFaultControl {
    pub fn new(ssh_user: Option<String>, use_sudo: bool) -> Self {
        Self {
            ssh_user,
            use_sudo,
            ssh: PathBuf::from("ssh"),
        }
    }

    /// Run `program` instead of the `ssh` found on `PATH`.
    pub fn with_ssh_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.ssh = program.into();
        self
    }

    fn destination(&self, target: &str) -> String {
        match &self.ssh_user {
            Some(user) => format!("{user}@{target}"),
            None => target.to_string(),
        }
    }

    /// Rules making up one edge, as iptables argument tails after the chain name.
    fn rules(peer: &str, method: IsolationMethod) -> [(&'static str, [String; 4]); 2] {
        [
            ("INPUT", ["-s".into(), peer.into(), "-j".into(), method.as_str().into()]),
            ("OUTPUT", ["-d".into(), peer.into(), "-j".into(), method.as_str().into()]),
        ]
    }

    async fn iptables(
        &self,
        target: &str,
        op: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<CommandOutput, FaultError> {
        let destination = self.destination(target);
        let mut args: Vec<&str> = vec!["-o", "BatchMode=yes", destination.as_str()];
        if self.use_sudo {
            args.push("sudo");
        }
        args.push("iptables");
        args.push(op);
        args.push(chain);
        args.extend(rule.iter().map(String::as_str));

        let mut cmd = Command::new(&self.ssh);
        cmd.args(&args);
        run(cmd, "ssh", &args).await
    }

    async fn rule_present(&self, target: &str, chain: &str, rule: &[String]) -> Result<bool, FaultError> {
        // `iptables -C` exits 1 when the rule is absent; anything else is a real failure.
        let output = self.iptables(target, "-C", chain, rule).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(output.into_error()),
        }
    }
}

#[async_trait]
impl FaultControl for IptablesFaultControl {
    async fn apply(
        &self,
        target: &str,
        peer: &str,
        action: FaultAction,
        method: IsolationMethod,
    ) -> Result<(), FaultError> {
        for (chain, rule) in Self::rules(peer, method) {
            match action {
                FaultAction::Disconnect => {
                    if !self.rule_present(target, chain, &rule).await? {
                        self.iptables(target, "-I", chain, &rule).await?.check()?;
                    }
                }
                FaultAction::Reconnect => {
                    let mut deletions = 0;
                    while deletions < MAX_RULE_DELETIONS && self.rule_present(target, chain, &rule).await? {
                        self.iptables(target, "-D", chain, &rule).await?.check()?;
                        deletions += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Exit status and stderr of a finished command.
#[derive(Debug)]
struct CommandOutput {
    command: String,
    code: Option<i32>,
    stderr: String,
}

impl CommandOutput {
    fn check(self) -> Result<(), FaultError> {
        if self.code == Some(0) {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> FaultError {
        FaultError::CommandFailed {
            command: self.command,
            code: self.code,
            stderr: self.stderr,
        }
    }
}

async fn run(mut cmd: Command, program: &'static str, args: &[&str]) -> Result<CommandOutput, FaultError> {
    debug!(program, args = ?args, "running fault control command");

    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context(IoSnafu { operation: program })?;

    Ok(CommandOutput {
        command: format!("{program} {}", args.join(" ")),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

async fn run_checked(cmd: Command, program: &'static str, args: &[&str]) -> Result<CommandOutput, FaultError> {
    let output = run(cmd, program, args).await?;
    if output.code == Some(0) {
        Ok(output)
    } else {
        Err(output.into_error())
    }
}

/// Fault control errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FaultError {
    /// The fault control command could not be started.
    #[snafu(display("I/O error during {operation}: {source}"))]
    Io {
        operation: &'static str,
        source: std::io::Error,
    },

    /// The fault control command exited unsuccessfully.
    #[snafu(display(
        "command failed ({}): {command}\nstderr: {stderr}",
        code.map_or("signal".to_string(), |c| c.to_string())
    ))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Unknown isolation method name.
    #[snafu(display("unknown isolation method '{name}' (expected REJECT or DROP)"))]
    InvalidMethod { name: String },

    /// One or more peers could not be reconnected.
    #[snafu(display("failed to reconnect {target} from {}: {first}", failed.join(", ")))]
    ReconnectIncomplete {
        target: String,
        failed: Vec<String>,
        first: Box<FaultError>,
    },
}
