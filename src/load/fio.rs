//! fio inside the workload pod, driven through `kubectl exec`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::process::Command;
use tracing::debug;

use super::FailedSnafu;
use super::LoadError;
use super::SpawnSnafu;
use super::Workload;

/// Path the workload pod mounts the volume at.
pub const DEFAULT_TARGET: &str = "/volume/test";

#[derive(Debug, Clone)]
pub struct FioWorkload {
    kubectl: String,
    namespace: String,
    pod: String,
    kubeconfig: Option<PathBuf>,
    target: String,
}

impl FioWorkload {
    pub fn new(kubectl: impl Into<String>, namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            kubeconfig: None,
            target: DEFAULT_TARGET.to_string(),
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    fn args(&self, duration: Duration) -> Vec<String> {
        // fio only accepts whole seconds; never ask for a zero-length run.
        let runtime = duration.as_secs().max(1);
        vec![
            "-n".into(),
            self.namespace.clone(),
            "exec".into(),
            self.pod.clone(),
            "--".into(),
            "fio".into(),
            "--name=benchtest".into(),
            "--size=50m".into(),
            format!("--filename={}", self.target),
            "--direct=1".into(),
            "--rw=randrw".into(),
            "--ioengine=libaio".into(),
            "--bs=4k".into(),
            "--iodepth=16".into(),
            "--numjobs=1".into(),
            "--time_based".into(),
            format!("--runtime={runtime}"),
        ]
    }
}

#[async_trait]
impl Workload for FioWorkload {
    async fn run(&self, duration: Duration) -> Result<(), LoadError> {
        let args = self.args(duration);
        let command = format!("{} {}", self.kubectl, args.join(" "));
        debug!(pod = %self.pod, command = %command, "running fio");

        let mut cmd = Command::new(&self.kubectl);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        // The child is killed if the run is cancelled mid-flight.
        let output = cmd
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context(SpawnSnafu { command: command.clone() })?;

        if !output.status.success() {
            return FailedSnafu {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_run_fio_in_pod() {
        let fio = FioWorkload::new("kubectl", "default", "fio");
        let args = fio.args(Duration::from_secs(20));

        assert_eq!(args[..5], ["-n", "default", "exec", "fio", "--"]);
        assert_eq!(args[5], "fio");
        assert!(args.contains(&"--filename=/volume/test".to_string()));
        assert!(args.contains(&"--time_based".to_string()));
        assert_eq!(args.last().unwrap(), "--runtime=20");
    }

    #[test]
    fn test_sub_second_duration_rounds_up() {
        let fio = FioWorkload::new("kubectl", "default", "fio").with_target("/dev/sdb");
        let args = fio.args(Duration::from_millis(200));
        assert_eq!(args.last().unwrap(), "--runtime=1");
        assert!(args.contains(&"--filename=/dev/sdb".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let fio = FioWorkload::new("/nonexistent/kubectl", "default", "fio");
        let err = fio.run(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LoadError::Spawn { .. }));
    }
}
