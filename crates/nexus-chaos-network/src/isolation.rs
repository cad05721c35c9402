//! Node isolation on top of [`FaultControl`].
//!
//! [`NodeIsolator`] applies one edge per peer address. [`Isolation`] is the
//! scoped form used by scenarios: it fixes the target and the peer set once,
//! records which edges are live, and reconnects the whole peer set on
//! teardown no matter how far the disconnect got.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::info;
use tracing::warn;

use crate::fault_injection::FaultAction;
use crate::fault_injection::FaultControl;
use crate::fault_injection::FaultError;
use crate::fault_injection::IsolationMethod;

/// How reconnection failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Every peer is attempted, then any failure is returned.
    Checked,
    /// Every peer is attempted and failures are only logged.
    Tolerant,
}

impl ReconnectMode {
    pub fn from_check_errors(check_errors: bool) -> Self {
        if check_errors { ReconnectMode::Checked } else { ReconnectMode::Tolerant }
    }
}

/// An active fault between the isolated node and one peer address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct IsolationEdge {
    /// Node cut off from the peer.
    pub target: String,
    /// Peer address the fault applies to.
    pub peer: String,
    pub method: IsolationMethod,
}

/// Outcome of a reconnect pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectReport {
    /// Peers whose reconnect command succeeded, in peer order.
    pub reconnected: Vec<String>,
    /// Peers still isolated after the pass.
    pub failed: Vec<String>,
}

impl ReconnectReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Disconnects and reconnects a node from a set of peer addresses.
#[derive(Clone)]
pub struct NodeIsolator {
    control: Arc<dyn FaultControl>,
}

impl NodeIsolator {
    pub fn new(control: Arc<dyn FaultControl>) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &Arc<dyn FaultControl> {
        &self.control
    }

    /// Disconnect `target` from every peer, stopping at the first failure.
    ///
    /// Returns the edges that were applied before returning. On error the
    /// edges applied so far are handed back alongside it so the caller can
    /// still reverse them.
    pub async fn disconnect(
        &self,
        target: &str,
        peers: &[String],
        method: IsolationMethod,
    ) -> Result<Vec<IsolationEdge>, (Vec<IsolationEdge>, FaultError)> {
        info!(target_node = %target, peers = ?peers, method = %method, "disconnecting node");

        let mut applied = Vec::with_capacity(peers.len());
        for peer in peers {
            if let Err(e) = self.control.apply(target, peer, FaultAction::Disconnect, method).await {
                warn!(target_node = %target, peer = %peer, error = %e, "failed to disconnect peer");
                return Err((applied, e));
            }
            applied.push(IsolationEdge {
                target: target.to_string(),
                peer: peer.clone(),
                method,
            });
        }
        Ok(applied)
    }

    /// Reconnect `target` to every peer.
    ///
    /// All peers are attempted in both modes. In [`ReconnectMode::Checked`]
    /// any failure is returned after the pass; in [`ReconnectMode::Tolerant`]
    /// failures are logged and reported but never returned as an error.
    pub async fn reconnect(
        &self,
        target: &str,
        peers: &[String],
        method: IsolationMethod,
        mode: ReconnectMode,
    ) -> Result<ReconnectReport, FaultError> {
        info!(target_node = %target, peers = ?peers, method = %method, mode = ?mode, "reconnecting node");

        let mut report = ReconnectReport::default();
        let mut first_error = None;
        for peer in peers {
            match self.control.apply(target, peer, FaultAction::Reconnect, method).await {
                Ok(()) => report.reconnected.push(peer.clone()),
                Err(e) => {
                    warn!(target_node = %target, peer = %peer, error = %e, "failed to reconnect peer");
                    report.failed.push(peer.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        match (mode, first_error) {
            (ReconnectMode::Checked, Some(first)) => Err(FaultError::ReconnectIncomplete {
                target: target.to_string(),
                failed: report.failed,
                first: Box::new(first),
            }),
            _ => Ok(report),
        }
    }
}

/// A scoped isolation of one node from a fixed peer set.
///
/// The peer set is resolved once and used for both directions so that
/// disconnect and reconnect always agree on scope. Dropping an `Isolation`
/// with live edges schedules a tolerant reconnect on the current tokio
/// runtime. That task is only guaranteed to run if it is tracked (see
/// [`Isolation::with_tracker`]) and the tracker is waited on before the
/// runtime shuts down; callers should still call [`Isolation::teardown`].
pub struct Isolation {
    isolator: NodeIsolator,
    target: String,
    peers: Vec<String>,
    method: IsolationMethod,
    active: BTreeSet<IsolationEdge>,
    torn_down: bool,
    tracker: Option<TaskTracker>,
}

impl Isolation {
    pub fn new(isolator: NodeIsolator, target: impl Into<String>, peers: Vec<String>, method: IsolationMethod) -> Self {
        Self {
            isolator,
            target: target.into(),
            peers,
            method,
            active: BTreeSet::new(),
            torn_down: false,
            tracker: None,
        }
    }

    /// Track the reconnect scheduled on drop so it can be awaited.
    pub fn with_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn method(&self) -> IsolationMethod {
        self.method
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_edges(&self) -> impl Iterator<Item = &IsolationEdge> {
        self.active.iter()
    }

    /// Disconnect the target from the whole peer set.
    ///
    /// Edges applied before a failure stay recorded as active.
    pub async fn disconnect(&mut self) -> Result<(), FaultError> {
        self.torn_down = false;
        let result = self.isolator.disconnect(&self.target, &self.peers, self.method).await;
        match result {
            Ok(edges) => {
                self.active.extend(edges);
                Ok(())
            }
            Err((edges, e)) => {
                self.active.extend(edges);
                Err(e)
            }
        }
    }

    /// Reconnect the target to the whole peer set.
    pub async fn reconnect(&mut self, mode: ReconnectMode) -> Result<ReconnectReport, FaultError> {
        let result = self.isolator.reconnect(&self.target, &self.peers, self.method, mode).await;
        let report = match &result {
            Ok(report) => report.clone(),
            Err(FaultError::ReconnectIncomplete { failed, .. }) => ReconnectReport {
                reconnected: self.peers.iter().filter(|p| !failed.contains(*p)).cloned().collect(),
                failed: failed.clone(),
            },
            Err(_) => ReconnectReport::default(),
        };
        self.active.retain(|edge| !report.reconnected.contains(&edge.peer));
        result
    }

    /// Tolerant reconnect of every peer in scope, whether or not it was
    /// ever disconnected.
    pub async fn teardown(&mut self) -> ReconnectReport {
        let report = match self.reconnect(ReconnectMode::Tolerant).await {
            Ok(report) => report,
            // Tolerant mode never returns an error.
            Err(_) => ReconnectReport::default(),
        };
        if !report.is_complete() {
            warn!(
                target_node = %self.target,
                failed = ?report.failed,
                "teardown left peers unreconnected"
            );
        }
        self.torn_down = true;
        report
    }
}

impl Drop for Isolation {
    fn drop(&mut self) {
        if self.torn_down || self.active.is_empty() {
            return;
        }
        warn!(
            target_node = %self.target,
            edges = self.active.len(),
            "isolation dropped with active edges, scheduling reconnect"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let isolator = self.isolator.clone();
                let target = self.target.clone();
                let peers = self.peers.clone();
                let method = self.method;
                let reconnect = async move {
                    match isolator.reconnect(&target, &peers, method, ReconnectMode::Tolerant).await {
                        Ok(report) if !report.is_complete() => {
                            warn!(target_node = %target, failed = ?report.failed, "peers still isolated after drop");
                        }
                        _ => {}
                    }
                };
                match &self.tracker {
                    Some(tracker) => handle.spawn(tracker.track_future(reconnect)),
                    None => handle.spawn(reconnect),
                };
            }
            Err(_) => {
                warn!(target_node = %self.target, "no runtime available, edges left in place");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Records calls and keeps a set of isolated (target, peer) pairs.
    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<(String, FaultAction, IsolationMethod)>>,
        isolated: Mutex<HashSet<String>>,
        fail_peers: HashSet<(String, FaultAction)>,
    }

    impl RecordingControl {
        fn failing(peer: &str, action: FaultAction) -> Self {
            Self {
                fail_peers: HashSet::from([(peer.to_string(), action)]),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl FaultControl for RecordingControl {
        async fn apply(
            &self,
            _target: &str,
            peer: &str,
            action: FaultAction,
            method: IsolationMethod,
        ) -> Result<(), FaultError> {
            self.calls.lock().unwrap().push((peer.to_string(), action, method));
            if self.fail_peers.contains(&(peer.to_string(), action)) {
                return Err(FaultError::CommandFailed {
                    command: format!("fault {peer}"),
                    code: Some(1),
                    stderr: "unreachable".into(),
                });
            }
            let mut isolated = self.isolated.lock().unwrap();
            match action {
                FaultAction::Disconnect => isolated.insert(peer.to_string()),
                FaultAction::Reconnect => isolated.remove(peer),
            };
            Ok(())
        }
    }

    fn peers(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_disconnect_applies_one_edge_per_peer() {
        let control = Arc::new(RecordingControl::default());
        let isolator = NodeIsolator::new(control.clone());

        let edges = isolator
            .disconnect("node-2", &peers(&["10.0.0.1", "10.0.0.3"]), IsolationMethod::Drop)
            .await
            .unwrap();

        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.method == IsolationMethod::Drop && e.target == "node-2"));
        assert_eq!(control.isolated.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_unisolated_peer_is_ok() {
        let control = Arc::new(RecordingControl::default());
        let isolator = NodeIsolator::new(control.clone());

        let report = isolator
            .reconnect("node-2", &peers(&["10.0.0.1"]), IsolationMethod::Reject, ReconnectMode::Checked)
            .await
            .unwrap();
        assert_eq!(report.reconnected, vec!["10.0.0.1".to_string()]);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_disconnect_failure_returns_applied_edges() {
        let control = Arc::new(RecordingControl::failing("10.0.0.3", FaultAction::Disconnect));
        let isolator = NodeIsolator::new(control.clone());

        let (applied, err) = isolator
            .disconnect("node-2", &peers(&["10.0.0.1", "10.0.0.3", "10.0.0.4"]), IsolationMethod::Reject)
            .await
            .unwrap_err();

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].peer, "10.0.0.1");
        assert!(matches!(err, FaultError::CommandFailed { .. }));
        // Fails fast: the peer after the failing one is never touched.
        assert_eq!(control.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_checked_reconnect_attempts_every_peer() {
        let control = Arc::new(RecordingControl::failing("10.0.0.1", FaultAction::Reconnect));
        let isolator = NodeIsolator::new(control.clone());

        let err = isolator
            .reconnect("node-2", &peers(&["10.0.0.1", "10.0.0.3"]), IsolationMethod::Reject, ReconnectMode::Checked)
            .await
            .unwrap_err();

        match err {
            FaultError::ReconnectIncomplete { failed, .. } => assert_eq!(failed, vec!["10.0.0.1".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(control.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tolerant_reconnect_never_errors() {
        let control = Arc::new(RecordingControl::failing("10.0.0.1", FaultAction::Reconnect));
        let isolator = NodeIsolator::new(control.clone());

        let report = isolator
            .reconnect("node-2", &peers(&["10.0.0.1", "10.0.0.3"]), IsolationMethod::Drop, ReconnectMode::Tolerant)
            .await
            .unwrap();
        assert_eq!(report.failed, vec!["10.0.0.1".to_string()]);
        assert_eq!(report.reconnected, vec!["10.0.0.3".to_string()]);
    }

    #[tokio::test]
    async fn test_isolation_teardown_covers_whole_scope_after_partial_disconnect() {
        let control = Arc::new(RecordingControl::failing("10.0.0.3", FaultAction::Disconnect));
        let mut isolation = Isolation::new(
            NodeIsolator::new(control.clone()),
            "node-2",
            peers(&["10.0.0.1", "10.0.0.3", "10.0.0.4"]),
            IsolationMethod::Reject,
        );

        assert!(isolation.disconnect().await.is_err());
        assert!(isolation.is_active());
        assert_eq!(isolation.active_edges().count(), 1);

        let report = isolation.teardown().await;
        assert_eq!(report.reconnected.len(), 3);
        assert!(!isolation.is_active());

        let reconnects: Vec<_> = control
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, action, _)| *action == FaultAction::Reconnect)
            .map(|(peer, _, _)| peer.clone())
            .collect();
        assert_eq!(reconnects, peers(&["10.0.0.1", "10.0.0.3", "10.0.0.4"]));
        assert!(control.isolated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_restores_reachability() {
        for method in [IsolationMethod::Reject, IsolationMethod::Drop] {
            let control = Arc::new(RecordingControl::default());
            let mut isolation = Isolation::new(
                NodeIsolator::new(control.clone()),
                "node-2",
                peers(&["10.0.0.1", "10.0.0.3"]),
                method,
            );

            isolation.disconnect().await.unwrap();
            assert_eq!(control.isolated.lock().unwrap().len(), 2);
            isolation.reconnect(ReconnectMode::Checked).await.unwrap();
            assert!(control.isolated.lock().unwrap().is_empty());
            assert!(!isolation.is_active());
        }
    }

    #[tokio::test]
    async fn test_drop_with_active_edges_schedules_reconnect() {
        let control = Arc::new(RecordingControl::default());
        {
            let mut isolation = Isolation::new(
                NodeIsolator::new(control.clone()),
                "node-2",
                peers(&["10.0.0.1"]),
                IsolationMethod::Drop,
            );
            isolation.disconnect().await.unwrap();
        }
        // Let the spawned reconnect run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(control.isolated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tracked_drop_reconnect_completes_before_wait_returns() {
        let control = Arc::new(RecordingControl::default());
        let tracker = TaskTracker::new();
        {
            let mut isolation = Isolation::new(
                NodeIsolator::new(control.clone()),
                "node-2",
                peers(&["10.0.0.1", "10.0.0.3"]),
                IsolationMethod::Reject,
            )
            .with_tracker(tracker.clone());
            isolation.disconnect().await.unwrap();
            assert_eq!(control.isolated.lock().unwrap().len(), 2);
        }

        tracker.close();
        tracker.wait().await;
        assert!(control.isolated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_after_teardown_schedules_nothing() {
        let control = Arc::new(RecordingControl::default());
        let tracker = TaskTracker::new();
        {
            let mut isolation = Isolation::new(
                NodeIsolator::new(control.clone()),
                "node-2",
                peers(&["10.0.0.1"]),
                IsolationMethod::Drop,
            )
            .with_tracker(tracker.clone());
            isolation.disconnect().await.unwrap();
            isolation.teardown().await;
        }

        assert!(tracker.is_empty());
        assert_eq!(control.calls.lock().unwrap().len(), 2);
    }
}
