//! Bounded polling for asynchronous state convergence.
//!
//! [`ConditionPoller::wait_for`] evaluates a producer and a predicate at a
//! fixed interval until the predicate holds or the timeout elapses. A
//! timeout carries the last observed value so a failure reads
//! "expected healthy, last observed degraded" rather than just "timed out".
//!
//! Time is measured with `tokio::time`, so tests running on a paused clock
//! see the full budget elapse without waiting for it.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use snafu::Snafu;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::cluster::ChildState;
use crate::cluster::ClusterError;
use crate::cluster::ClusterState;
use crate::cluster::NexusChild;
use crate::cluster::NexusState;
use crate::cluster::VolumeState;

/// Timeout and interval for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
    /// Log producer errors and keep polling instead of failing.
    pub tolerate_errors: bool,
}

impl PollConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            tolerate_errors: false,
        }
    }

    pub fn tolerating_errors(mut self) -> Self {
        self.tolerate_errors = true;
        self
    }
}

/// Polling errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PollError {
    /// The predicate never held within the budget.
    #[snafu(display(
        "timed out after {}ms waiting for {what} ({attempts} polls), last observed: {}",
        timeout.as_millis(),
        last_observed.as_deref().unwrap_or("nothing")
    ))]
    Timeout {
        what: String,
        timeout: Duration,
        attempts: u32,
        last_observed: Option<String>,
    },

    /// The producer failed and the poll does not tolerate errors.
    #[snafu(display("failed to observe {what}: {source}"))]
    Producer {
        what: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PollError {
    /// The last value seen before a timeout.
    pub fn last_observed(&self) -> Option<&str> {
        match self {
            PollError::Timeout { last_observed, .. } => last_observed.as_deref(),
            PollError::Producer { .. } => None,
        }
    }
}

/// Evaluates predicates against live cluster state within a budget.
#[derive(Debug, Clone, Copy)]
pub struct ConditionPoller {
    config: PollConfig,
}

impl ConditionPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll `producer` until `predicate` accepts its value.
    ///
    /// The first evaluation happens immediately; later ones are spaced by
    /// the configured interval. Returns the accepted value.
    pub async fn wait_for<T, E, F, Fut, P>(&self, what: &str, mut producer: F, mut predicate: P) -> Result<T, PollError>
    where
        T: fmt::Display,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&T) -> bool,
    {
        let PollConfig {
            timeout,
            interval,
            tolerate_errors,
        } = self.config;
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_observed = None;

        info!(what, timeout_ms = timeout.as_millis() as u64, "waiting for condition");

        loop {
            attempts += 1;
            match producer().await {
                Ok(value) => {
                    if predicate(&value) {
                        debug!(what, attempts, elapsed_ms = start.elapsed().as_millis() as u64, "condition met");
                        return Ok(value);
                    }
                    last_observed = Some(value.to_string());
                }
                Err(e) if tolerate_errors => {
                    warn!(what, error = %e, "tolerated poll error");
                    last_observed = Some(format!("error: {e}"));
                }
                Err(e) => {
                    return Err(PollError::Producer {
                        what: what.to_string(),
                        source: Box::new(e),
                    });
                }
            }

            if start.elapsed() >= timeout {
                return Err(PollError::Timeout {
                    what: what.to_string(),
                    timeout,
                    attempts,
                    last_observed,
                });
            }
            // Never poll faster than the interval, and never sleep past the deadline.
            let remaining = timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(interval.min(remaining).max(MIN_INTERVAL)).await;
        }
    }

    /// Wait for the volume to report `expected`.
    pub async fn volume_state(
        &self,
        cluster: &dyn ClusterState,
        volume: Uuid,
        expected: VolumeState,
    ) -> Result<VolumeState, PollError> {
        self.wait_for(
            &format!("volume state == {expected}"),
            || cluster.volume_state(volume),
            |state| *state == expected,
        )
        .await
    }

    /// Wait for the nexus to report `expected`.
    pub async fn nexus_state(
        &self,
        cluster: &dyn ClusterState,
        volume: Uuid,
        expected: NexusState,
    ) -> Result<NexusState, PollError> {
        self.wait_for(
            &format!("nexus state == {expected}"),
            || cluster.nexus_state(volume),
            |state| *state == expected,
        )
        .await
    }

    /// Wait for the nexus to have exactly `expected` children.
    pub async fn child_count(
        &self,
        cluster: &dyn ClusterState,
        volume: Uuid,
        expected: usize,
    ) -> Result<usize, PollError> {
        self.wait_for(
            &format!("children count == {expected}"),
            || async move { cluster.children(volume).await.map(|children| children.len()) },
            |count| *count == expected,
        )
        .await
    }

    /// Wait for child `index` to reach `expected`.
    ///
    /// The nexus must have exactly `child_count` children on every poll; any
    /// other length is a producer error.
    pub async fn child_state(
        &self,
        cluster: &dyn ClusterState,
        volume: Uuid,
        child_count: usize,
        index: usize,
        expected: ChildState,
    ) -> Result<ChildState, PollError> {
        self.wait_for(
            &format!("child[{index}] state == {expected}"),
            || async move {
                let children = cluster.children(volume).await?;
                child_at(volume, &children, child_count, index)
            },
            |state| *state == expected,
        )
        .await
    }
}

/// Floor on the sleep between polls.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

fn child_at(volume: Uuid, children: &[NexusChild], expected: usize, index: usize) -> Result<ChildState, ClusterError> {
    if children.len() != expected || index >= children.len() {
        return Err(ClusterError::ChildCount {
            volume,
            expected,
            actual: children.len(),
        });
    }
    Ok(children[index].state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    fn poller(timeout_secs: u64) -> ConditionPoller {
        ConditionPoller::new(PollConfig::new(Duration::from_secs(timeout_secs), Duration::from_secs(1)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_accepted_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let start = Instant::now();
        let value = poller(90)
            .wait_for(
                "counter >= 3",
                || {
                    let counter = counter.clone();
                    async move { Ok::<_, ClusterError>(counter.fetch_add(1, Ordering::SeqCst) + 1) }
                },
                |v| *v >= 3,
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two intervals between three polls.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_observed_value() {
        let start = Instant::now();
        let err = poller(90)
            .wait_for(
                "volume state == healthy",
                || async { Ok::<_, ClusterError>(VolumeState::Degraded) },
                |s| *s == VolumeState::Healthy,
            )
            .await
            .unwrap_err();

        assert_eq!(err.last_observed(), Some("degraded"));
        match &err {
            PollError::Timeout { attempts, .. } => assert_eq!(*attempts, 91),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("last observed: degraded"));
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_error_is_fatal_by_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = poller(90)
            .wait_for(
                "volume state == degraded",
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<VolumeState, _>(ClusterError::UnexpectedState {
                            kind: "volume",
                            value: "rebuilding".into(),
                        })
                    }
                },
                |s| *s == VolumeState::Degraded,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Producer { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerated_producer_errors_keep_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = PollConfig::new(Duration::from_secs(10), Duration::from_secs(1)).tolerating_errors();

        let state = ConditionPoller::new(config)
            .wait_for(
                "volume state == healthy",
                || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ClusterError::VolumeNotFound { volume: Uuid::nil() })
                        } else {
                            Ok(VolumeState::Healthy)
                        }
                    }
                },
                |s| *s == VolumeState::Healthy,
            )
            .await
            .unwrap();

        assert_eq!(state, VolumeState::Healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_is_respected_with_short_timeout() {
        let start = Instant::now();
        let config = PollConfig::new(Duration::from_millis(2500), Duration::from_secs(1));
        let err = ConditionPoller::new(config)
            .wait_for("never", || async { Ok::<_, ClusterError>(0u32) }, |_| false)
            .await
            .unwrap_err();

        // Polls at 0s, 1s, 2s and a final one at the 2.5s deadline.
        match err {
            PollError::Timeout { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[test]
    fn test_child_at_requires_exact_count() {
        let children = vec![NexusChild {
            uri: "bdev:///a".into(),
            state: ChildState::Online,
        }];
        assert_eq!(child_at(Uuid::nil(), &children, 1, 0).unwrap(), ChildState::Online);

        let err = child_at(Uuid::nil(), &children, 2, 1).unwrap_err();
        assert!(matches!(err, ClusterError::ChildCount { expected: 2, actual: 1, .. }));
    }
}
