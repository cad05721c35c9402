//! I/O load against the published volume.
//!
//! A [`LoadGenerator`] runs a [`Workload`] either in the foreground, where
//! the caller awaits the outcome, or in the background, where the caller
//! gets a [`LoadHandle`] and keeps going. Background runs are cancellable
//! so that no load outlives the scenario that started it.

pub mod fio;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use fio::FioWorkload;

/// An I/O job against the currently mounted volume.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Run the job for `duration`. Returns once the job exits.
    async fn run(&self, duration: Duration) -> Result<(), LoadError>;
}

/// Workload errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// The workload command could not be started.
    #[snafu(display("failed to run {command}: {source}"))]
    Spawn { command: String, source: std::io::Error },

    /// The workload exited unsuccessfully.
    #[snafu(display("{command} exited with {}: {stderr}", code.map_or("signal".to_string(), |c| c.to_string())))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The workload reported an I/O failure without running a command.
    #[snafu(display("workload failed: {reason}"))]
    Rejected { reason: String },

    /// A background policy name that is neither `join` nor `detached`.
    #[snafu(display("unknown background policy '{name}' (expected join or detached)"))]
    UnknownPolicy { name: String },

    /// The background run was cancelled before it finished.
    #[snafu(display("load cancelled"))]
    Cancelled,

    /// The background run did not finish within its budget.
    #[snafu(display("load did not finish within {}ms", timeout.as_millis()))]
    Timeout { timeout: Duration },

    /// The background task panicked.
    #[snafu(display("load task panicked: {message}"))]
    Panicked { message: String },
}

/// What happens to the background load once the final foreground load is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundPolicy {
    /// Await the background run; its failure fails the scenario.
    #[default]
    Join,
    /// Record the outcome if finished, otherwise cancel it.
    Detached,
}

impl BackgroundPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundPolicy::Join => "join",
            BackgroundPolicy::Detached => "detached",
        }
    }
}

impl fmt::Display for BackgroundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackgroundPolicy {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "join" => Ok(BackgroundPolicy::Join),
            "detached" => Ok(BackgroundPolicy::Detached),
            _ => UnknownPolicySnafu { name: s.trim() }.fail(),
        }
    }
}

/// Runs a workload for a fixed duration.
#[derive(Clone)]
pub struct LoadGenerator {
    workload: Arc<dyn Workload>,
    duration: Duration,
}

impl fmt::Debug for LoadGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadGenerator").field("duration", &self.duration).finish_non_exhaustive()
    }
}

impl LoadGenerator {
    pub fn new(workload: Arc<dyn Workload>, duration: Duration) -> Self {
        Self { workload, duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run the workload and wait for it.
    pub async fn run_foreground(&self) -> Result<(), LoadError> {
        let start = Instant::now();
        info!(duration_ms = self.duration.as_millis() as u64, "running foreground load");
        let result = self.workload.run(self.duration).await;
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, ok = result.is_ok(), "foreground load finished");
        result
    }

    /// Start the workload without waiting for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_background(&self) -> LoadHandle {
        let token = CancellationToken::new();
        let workload = self.workload.clone();
        let duration = self.duration;
        let cancelled = token.clone();

        info!(duration_ms = duration.as_millis() as u64, "starting background load");
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => Err(LoadError::Cancelled),
                result = workload.run(duration) => {
                    if let Err(e) = &result {
                        warn!(error = %e, "background load failed");
                    }
                    result
                }
            }
        });

        LoadHandle {
            task: Some(task),
            token,
            started: Instant::now(),
        }
    }
}

/// A running background load.
///
/// Dropping the handle cancels the run.
#[derive(Debug)]
pub struct LoadHandle {
    task: Option<JoinHandle<Result<(), LoadError>>>,
    token: CancellationToken,
    started: Instant,
}

impl LoadHandle {
    /// Request cancellation. The run stops at its next await point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait up to `timeout` for the run to finish.
    ///
    /// A run still going after `timeout` is cancelled and reported as
    /// [`LoadError::Timeout`].
    pub async fn finish(mut self, timeout: Duration) -> Result<(), LoadError> {
        let Some(mut task) = self.task.take() else {
            return Err(LoadError::Cancelled);
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                self.token.cancel();
                task.abort();
                Err(LoadError::Timeout { timeout })
            }
        }
    }

    /// Cancel the run and wait for its task to exit.
    ///
    /// Once this returns the workload is no longer running.
    pub async fn stop(mut self) -> Result<(), LoadError> {
        let Some(task) = self.task.take() else {
            return Err(LoadError::Cancelled);
        };
        self.token.cancel();
        flatten(task.await)
    }

    /// The outcome if the run already finished; otherwise cancel it and
    /// return `None`.
    pub async fn try_finish(mut self) -> Option<Result<(), LoadError>> {
        let task = self.task.take()?;
        if task.is_finished() {
            Some(flatten(task.await))
        } else {
            self.token.cancel();
            None
        }
    }
}

impl Drop for LoadHandle {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("cancelling background load on drop");
        }
        self.token.cancel();
    }
}

fn flatten(joined: Result<Result<(), LoadError>, tokio::task::JoinError>) -> Result<(), LoadError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(LoadError::Cancelled),
        Err(e) => Err(LoadError::Panicked { message: e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    /// Sleeps for the requested duration, optionally failing afterwards.
    struct SleepWorkload {
        runs: AtomicU32,
        fail: bool,
    }

    impl SleepWorkload {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Workload for SleepWorkload {
        async fn run(&self, duration: Duration) -> Result<(), LoadError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(duration).await;
            if self.fail {
                return Err(LoadError::Rejected {
                    reason: "I/O error on /volume/test".into(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_waits_for_workload() {
        let workload = SleepWorkload::new(false);
        let load = LoadGenerator::new(workload.clone(), Duration::from_secs(20));

        let start = Instant::now();
        load.run_foreground().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(workload.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_failure_is_surfaced() {
        let load = LoadGenerator::new(SleepWorkload::new(true), Duration::from_secs(1));
        let err = load.run_foreground().await.unwrap_err();
        assert!(matches!(err, LoadError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_does_not_block() {
        let load = LoadGenerator::new(SleepWorkload::new(false), Duration::from_secs(20));

        let start = Instant::now();
        let handle = load.spawn_background();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!handle.is_finished());

        handle.finish(Duration::from_secs(30)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_observed_on_finish() {
        let load = LoadGenerator::new(SleepWorkload::new(true), Duration::from_secs(5));
        let handle = load.spawn_background();
        let err = handle.finish(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, LoadError::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_times_out_and_cancels() {
        let load = LoadGenerator::new(SleepWorkload::new(false), Duration::from_secs(60));
        let handle = load.spawn_background();
        let err = handle.finish(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, LoadError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_finish_cancels_unfinished_run() {
        let load = LoadGenerator::new(SleepWorkload::new(false), Duration::from_secs(60));
        let handle = load.spawn_background();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.try_finish().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_finish_reports_finished_run() {
        let load = LoadGenerator::new(SleepWorkload::new(true), Duration::from_secs(1));
        let handle = load.spawn_background();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let outcome = handle.try_finish().await.unwrap();
        assert!(matches!(outcome, Err(LoadError::Rejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_run() {
        let load = LoadGenerator::new(SleepWorkload::new(false), Duration::from_secs(60));
        let handle = load.spawn_background();
        handle.cancel();
        let err = handle.finish(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_once_run_exits() {
        let workload = SleepWorkload::new(false);
        let load = LoadGenerator::new(workload.clone(), Duration::from_secs(60));
        let handle = load.spawn_background();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let start = Instant::now();
        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(workload.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_policy_parsing() {
        assert_eq!("join".parse::<BackgroundPolicy>().unwrap(), BackgroundPolicy::Join);
        assert_eq!(" Detached ".parse::<BackgroundPolicy>().unwrap(), BackgroundPolicy::Detached);
        let err = "forget".parse::<BackgroundPolicy>().unwrap_err();
        assert!(matches!(err, LoadError::UnknownPolicy { ref name } if name == "forget"));
        assert_eq!(BackgroundPolicy::default(), BackgroundPolicy::Join);
    }
}
