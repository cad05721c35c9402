//! Output formatting for CLI responses.
//!
//! Supports both human-readable and JSON output formats for
//! integration with scripts and CI.

use nexus_chaos::HarnessError;
use nexus_chaos::IsolationTarget;
use nexus_chaos::ScenarioKind;
use nexus_chaos::ScenarioReport;
use nexus_chaos_network::ReconnectReport;
use uuid::Uuid;

/// Trait for types that can be output in multiple formats.
pub trait Outputable {
    /// Convert to JSON value for structured output.
    fn to_json(&self) -> serde_json::Value;

    /// Convert to human-readable string.
    fn to_human(&self) -> String;
}

/// Print a value in the appropriate format.
pub fn print_output<T: Outputable>(value: &T, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&value.to_json())
                .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize: {}\"}}", e))
        );
    } else {
        println!("{}", value.to_human());
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| serde_json::json!({ "error": format!("failed to serialize: {e}") }))
}

impl Outputable for ScenarioReport {
    fn to_json(&self) -> serde_json::Value {
        let mut value = to_value(self);
        if let Some(map) = value.as_object_mut() {
            map.insert("status".into(), "passed".into());
        }
        value
    }

    fn to_human(&self) -> String {
        self.to_string()
    }
}

impl Outputable for IsolationTarget {
    fn to_json(&self) -> serde_json::Value {
        to_value(self)
    }

    fn to_human(&self) -> String {
        format!("Node:    {} ({})\nPeers:   {}", self.node, self.address, self.peers.join(", "))
    }
}

/// Scenario catalogue.
pub struct ScenarioListOutput;

impl Outputable for ScenarioListOutput {
    fn to_json(&self) -> serde_json::Value {
        let scenarios: Vec<_> = ScenarioKind::ALL
            .iter()
            .map(|kind| {
                serde_json::json!({
                    "name": kind.as_str(),
                    "description": kind.description(),
                    "min_peers": kind.min_peers(),
                    "injects_fault": kind.injects_fault(),
                    "background_load": kind.uses_background_load(),
                })
            })
            .collect();
        serde_json::json!({ "scenarios": scenarios })
    }

    fn to_human(&self) -> String {
        let width = ScenarioKind::ALL.iter().map(|kind| kind.as_str().len()).max().unwrap_or(0);
        let mut output = String::from("Scenarios:\n");
        for kind in ScenarioKind::ALL {
            output.push_str(&format!("  {:width$}  {}\n", kind.as_str(), kind.description()));
        }
        output.trim_end().to_string()
    }
}

/// Result of a manual reconnect.
pub struct ReconnectOutput {
    pub node: String,
    pub report: ReconnectReport,
}

impl Outputable for ReconnectOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "node": self.node,
            "status": if self.report.is_complete() { "reconnected" } else { "incomplete" },
            "reconnected": self.report.reconnected,
            "failed": self.report.failed,
        })
    }

    fn to_human(&self) -> String {
        let mut output = format!("Reconnected {} to {} peer(s)", self.node, self.report.reconnected.len());
        if !self.report.failed.is_empty() {
            output.push_str(&format!("\nFailed:  {}", self.report.failed.join(", ")));
        }
        output
    }
}

/// A failed scenario, printed in JSON mode before the error is returned.
pub struct FailureOutput {
    scenario: ScenarioKind,
    volume: Uuid,
    step: Option<String>,
    precondition: bool,
    error: String,
}

impl FailureOutput {
    pub fn new(scenario: ScenarioKind, volume: Uuid, error: &HarnessError) -> Self {
        Self {
            scenario,
            volume,
            step: error.failed_step().map(|step| step.to_string()),
            precondition: error.is_precondition(),
            error: error.to_string(),
        }
    }
}

impl Outputable for FailureOutput {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.precondition { "precondition-failed" } else { "failed" },
            "scenario": self.scenario.as_str(),
            "volume": self.volume,
            "step": self.step,
            "error": self.error,
        })
    }

    fn to_human(&self) -> String {
        match &self.step {
            Some(step) => format!("{} failed at {}: {}", self.scenario, step, self.error),
            None => format!("{} failed: {}", self.scenario, self.error),
        }
    }
}
