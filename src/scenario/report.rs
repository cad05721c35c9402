//! Scenario run reports.

use std::fmt;

use nexus_chaos_network::IsolationMethod;
use nexus_chaos_network::ReconnectReport;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use super::ScenarioKind;
use super::Step;
use crate::topology::IsolationTarget;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub elapsed_ms: u64,
    pub ok: bool,
}

/// What became of the background load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BackgroundLoadOutcome {
    /// The scenario runs no background load.
    #[default]
    NotStarted,
    Completed,
    Failed { error: String },
    /// Still running when the scenario ended and cancelled.
    Cancelled,
}

impl fmt::Display for BackgroundLoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackgroundLoadOutcome::NotStarted => f.write_str("not started"),
            BackgroundLoadOutcome::Completed => f.write_str("completed"),
            BackgroundLoadOutcome::Failed { error } => write!(f, "failed: {error}"),
            BackgroundLoadOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of a successful scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,
    pub volume: Uuid,
    pub target: Option<IsolationTarget>,
    pub method: Option<IsolationMethod>,
    pub steps: Vec<StepRecord>,
    pub background_load: BackgroundLoadOutcome,
    /// Peers reconnected and left unreconnected by the final teardown.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub teardown: Option<TeardownSummary>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownSummary {
    pub reconnected: Vec<String>,
    pub failed: Vec<String>,
}

impl From<ReconnectReport> for TeardownSummary {
    fn from(report: ReconnectReport) -> Self {
        Self {
            reconnected: report.reconnected,
            failed: report.failed,
        }
    }
}

impl ScenarioReport {
    pub fn step(&self, step: Step) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.step == step)
    }

    pub fn step_order(&self) -> Vec<Step> {
        self.steps.iter().map(|record| record.step).collect()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenario: {}", self.scenario)?;
        writeln!(f, "volume:   {}", self.volume)?;
        if let Some(target) = &self.target {
            writeln!(f, "target:   {} ({})", target.node, target.address)?;
            writeln!(f, "peers:    {}", target.peers.join(", "))?;
        }
        if let Some(method) = self.method {
            writeln!(f, "method:   {method}")?;
        }
        writeln!(f, "steps:")?;
        for record in &self.steps {
            let mark = if record.ok { "ok" } else { "FAILED" };
            writeln!(f, "  {:<26} {:>8}ms  {mark}", record.step.as_str(), record.elapsed_ms)?;
        }
        writeln!(f, "background load: {}", self.background_load)?;
        if let Some(teardown) = &self.teardown
            && !teardown.failed.is_empty()
        {
            writeln!(f, "teardown left peers isolated: {}", teardown.failed.join(", "))?;
        }
        write!(f, "elapsed: {}ms", self.elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let report = ScenarioReport {
            scenario: ScenarioKind::LossWhileIdle,
            volume: Uuid::nil(),
            target: None,
            method: Some(IsolationMethod::Drop),
            steps: vec![StepRecord {
                step: Step::Disconnect,
                elapsed_ms: 12,
                ok: true,
            }],
            background_load: BackgroundLoadOutcome::Failed {
                error: "fio exited with 1".into(),
            },
            teardown: None,
            elapsed_ms: 40_000,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "loss-while-idle");
        assert_eq!(json["method"], "DROP");
        assert_eq!(json["steps"][0]["step"], "disconnect");
        assert_eq!(json["background_load"]["status"], "failed");
        assert!(json.get("teardown").is_none());

        let text = report.to_string();
        assert!(text.contains("background load: failed: fio exited with 1"));
    }
}
