//! Harness configuration.
//!
//! Configuration is resolved in layers: built-in defaults, an optional TOML
//! file, `NEXUS_CHAOS_*` environment variables, and finally command line
//! flags applied by the binary. [`HarnessConfig::validate`] runs once all
//! layers are applied.
//!
//! Durations are written as human-readable strings (`"90s"`, `"1m30s"`,
//! `"500ms"`) or ISO 8601 (`"PT90S"`).
//!
//! ```toml
//! isolation_method = "DROP"
//! settle_delay = "5s"
//!
//! [timeouts]
//! disconnection = "2m"
//! repair = "5m"
//!
//! [fault_control]
//! kind = "iptables"
//! ssh_user = "root"
//! ```

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use nexus_chaos_network::IsolationMethod;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::load::BackgroundPolicy;
use crate::poll::PollConfig;

/// Prefix of every environment variable the harness reads.
pub const ENV_PREFIX: &str = "NEXUS_CHAOS_";

mod defaults {
    use std::path::PathBuf;
    use std::time::Duration;

    pub fn timeout() -> Duration {
        Duration::from_secs(90)
    }
    pub fn poll_interval() -> Duration {
        Duration::from_secs(1)
    }
    pub fn settle_delay() -> Duration {
        Duration::from_secs(5)
    }
    pub fn load_duration() -> Duration {
        Duration::from_secs(20)
    }

    pub fn kubectl_binary() -> String {
        "kubectl".to_string()
    }
    pub fn namespace() -> String {
        "mayastor".to_string()
    }
    pub fn workload_namespace() -> String {
        "default".to_string()
    }
    pub fn workload_pod() -> String {
        "fio".to_string()
    }

    pub fn script_path() -> PathBuf {
        "../lib/io_connect_node.sh".into()
    }
    pub fn script_working_dir() -> PathBuf {
        "./".into()
    }
}

/// Configuration errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("invalid duration '{input}': {reason}"))]
    InvalidDuration { input: String, reason: String },

    #[snafu(display("invalid value for {key}: '{value}' ({reason})"))]
    InvalidValue { key: String, value: String, reason: String },
}

/// Time budgets for bounded waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Budget for waits without a dedicated timeout.
    #[serde(default = "defaults::timeout", with = "duration_str")]
    pub default: Duration,
    /// Budget for the volume to report degraded after isolation.
    #[serde(default = "defaults::timeout", with = "duration_str")]
    pub disconnection: Duration,
    /// Budget for the volume to heal after reassignment.
    #[serde(default = "defaults::timeout", with = "duration_str")]
    pub repair: Duration,
    #[serde(default = "defaults::poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: defaults::timeout(),
            disconnection: defaults::timeout(),
            repair: defaults::timeout(),
            poll_interval: defaults::poll_interval(),
        }
    }
}

impl TimeoutConfig {
    pub fn default_poll(&self) -> PollConfig {
        PollConfig::new(self.default, self.poll_interval)
    }

    pub fn disconnection_poll(&self) -> PollConfig {
        PollConfig::new(self.disconnection, self.poll_interval)
    }

    pub fn repair_poll(&self) -> PollConfig {
        PollConfig::new(self.repair, self.poll_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// How long each workload run lasts.
    #[serde(default = "defaults::load_duration", with = "duration_str")]
    pub duration: Duration,
    /// What happens to the background load when the scenario ends.
    #[serde(default)]
    pub background: BackgroundPolicy,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            duration: defaults::load_duration(),
            background: BackgroundPolicy::default(),
        }
    }
}

/// Where kubectl finds the storage control plane and the workload pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubectlConfig {
    #[serde(default = "defaults::kubectl_binary")]
    pub binary: String,
    /// Namespace holding the volume resources.
    #[serde(default = "defaults::namespace")]
    pub namespace: String,
    #[serde(default = "defaults::workload_namespace")]
    pub workload_namespace: String,
    #[serde(default = "defaults::workload_pod")]
    pub workload_pod: String,
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            binary: defaults::kubectl_binary(),
            namespace: defaults::namespace(),
            workload_namespace: defaults::workload_namespace(),
            workload_pod: defaults::workload_pod(),
            kubeconfig: None,
        }
    }
}

/// Backend used to inject network faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FaultControlConfig {
    /// An external script called with `<target> <peer> <ACTION> <METHOD>`.
    Script {
        #[serde(default = "defaults::script_path")]
        path: PathBuf,
        #[serde(default = "defaults::script_working_dir")]
        working_dir: PathBuf,
    },
    /// iptables rules installed on the target over ssh.
    Iptables {
        #[serde(default)]
        ssh_user: Option<String>,
        #[serde(default)]
        sudo: bool,
    },
}

impl Default for FaultControlConfig {
    fn default() -> Self {
        FaultControlConfig::Script {
            path: defaults::script_path(),
            working_dir: defaults::script_working_dir(),
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Delay between starting background load and injecting the fault.
    #[serde(default = "defaults::settle_delay", with = "duration_str")]
    pub settle_delay: Duration,
    #[serde(default)]
    pub isolation_method: IsolationMethod,
    #[serde(default)]
    pub load: LoadConfig,
    /// Raises the per-scenario minimum peer count. A value below a
    /// scenario's own minimum is ignored for that scenario.
    #[serde(default)]
    pub min_peers: Option<usize>,
    #[serde(default)]
    pub kubectl: KubectlConfig,
    #[serde(default)]
    pub fault_control: FaultControlConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            settle_delay: defaults::settle_delay(),
            isolation_method: IsolationMethod::default(),
            load: LoadConfig::default(),
            min_peers: None,
            kubectl: KubectlConfig::default(),
            fault_control: FaultControlConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&contents).context(ParseTomlSnafu { path })
    }

    /// Defaults, then the file if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading configuration file");
                Self::from_toml_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `NEXUS_CHAOS_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let duration = |name: &str| -> Result<Option<Duration>, ConfigError> {
            var(name).map(|(_, value)| parse_duration(&value)).transpose()
        };

        if let Some(d) = duration("TIMEOUT")? {
            self.timeouts.default = d;
        }
        if let Some(d) = duration("DISCONNECTION_TIMEOUT")? {
            self.timeouts.disconnection = d;
        }
        if let Some(d) = duration("REPAIR_TIMEOUT")? {
            self.timeouts.repair = d;
        }
        if let Some(d) = duration("POLL_INTERVAL")? {
            self.timeouts.poll_interval = d;
        }
        if let Some(d) = duration("SETTLE_DELAY")? {
            self.settle_delay = d;
        }
        if let Some(d) = duration("LOAD_DURATION")? {
            self.load.duration = d;
        }
        if let Some((key, value)) = var("ISOLATION_METHOD") {
            self.isolation_method = value.parse::<IsolationMethod>().map_err(|e| {
                ConfigError::InvalidValue {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some((key, value)) = var("BACKGROUND_LOAD") {
            self.load.background = value.parse::<BackgroundPolicy>().map_err(|e| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some((key, value)) = var("MIN_PEERS") {
            let peers = value.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })?;
            self.min_peers = Some(peers);
        }
        if let Some((_, value)) = var("NAMESPACE") {
            self.kubectl.namespace = value;
        }
        if let Some((_, value)) = var("WORKLOAD_POD") {
            self.kubectl.workload_pod = value;
        }
        if let Some((_, value)) = var("KUBECONFIG") {
            self.kubectl.kubeconfig = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Reject budgets the poller cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.timeouts.poll_interval;
        if interval.is_zero() {
            return invalid("timeouts.poll_interval", interval, "must be greater than zero");
        }

        for (key, timeout) in [
            ("timeouts.default", self.timeouts.default),
            ("timeouts.disconnection", self.timeouts.disconnection),
            ("timeouts.repair", self.timeouts.repair),
        ] {
            if timeout.is_zero() {
                return invalid(key, timeout, "must be greater than zero");
            }
            if interval > timeout {
                return invalid(
                    "timeouts.poll_interval",
                    interval,
                    &format!("exceeds {key} ({})", format_duration(timeout)),
                );
            }
        }

        if self.load.duration.is_zero() {
            return invalid("load.duration", self.load.duration, "must be greater than zero");
        }
        if self.min_peers == Some(0) {
            return InvalidValueSnafu {
                key: "min_peers",
                value: "0",
                reason: "at least one peer is required",
            }
            .fail();
        }
        Ok(())
    }
}

fn invalid(key: &str, value: Duration, reason: &str) -> Result<(), ConfigError> {
    InvalidValueSnafu {
        key,
        value: format_duration(value),
        reason,
    }
    .fail()
}

/// Parse a duration string.
///
/// Supports:
/// - Human-readable: "500ms", "30s", "5m", "1h", "1m30s"
/// - ISO 8601: "PT90S", "PT1M30S", "P1D"
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return InvalidDurationSnafu {
            input,
            reason: "duration cannot be empty",
        }
        .fail();
    }

    if input.starts_with('P') || input.starts_with('p') {
        return parse_iso8601_duration(input);
    }
    parse_human_duration(input)
}

fn parse_human_duration(input: &str) -> Result<Duration, ConfigError> {
    let fail = |reason: &str| {
        InvalidDurationSnafu {
            input: input.to_string(),
            reason,
        }
        .fail()
    };

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return fail("expected a number");
        }
        let value: u64 = match rest[..digits].parse() {
            Ok(value) => value,
            Err(_) => return fail("number out of range"),
        };
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match rest[..unit_len].trim().to_ascii_lowercase().as_str() {
            "ms" => Duration::from_millis(value),
            "s" | "sec" | "secs" => Duration::from_secs(value),
            "m" | "min" | "mins" => Duration::from_secs(value.saturating_mul(60)),
            "h" | "hr" | "hrs" => Duration::from_secs(value.saturating_mul(3600)),
            "d" => Duration::from_secs(value.saturating_mul(86_400)),
            "" => return fail("missing unit (use ms, s, m, h or d)"),
            _ => return fail("unknown unit"),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Parse ISO 8601 duration (P[n]DT[n]H[n]M[n]S).
fn parse_iso8601_duration(input: &str) -> Result<Duration, ConfigError> {
    let upper = input.to_ascii_uppercase();
    let fail = |reason: &str| {
        InvalidDurationSnafu {
            input: input.to_string(),
            reason,
        }
        .fail()
    };

    let mut chars = upper.chars();
    if chars.next() != Some('P') {
        return fail("ISO 8601 duration must start with 'P'");
    }

    let mut seconds = 0f64;
    let mut in_time_part = false;
    let mut current = String::new();
    let mut saw_component = false;

    for c in chars {
        let scale = match c {
            'T' => {
                in_time_part = true;
                continue;
            }
            '0'..='9' | '.' => {
                current.push(c);
                continue;
            }
            'D' if !in_time_part => 86_400.0,
            'H' if in_time_part => 3600.0,
            'M' if in_time_part => 60.0,
            'S' if in_time_part => 1.0,
            _ => return fail("unsupported component (use D, H, M or S)"),
        };
        let value: f64 = match current.parse() {
            Ok(value) => value,
            Err(_) => return fail("invalid number"),
        };
        seconds += value * scale;
        current.clear();
        saw_component = true;
    }

    if !current.is_empty() || !saw_component {
        return fail("incomplete duration");
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) => Ok(duration),
        Err(_) => fail("duration out of range"),
    }
}

/// Render a duration in the form [`parse_duration`] accepts.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }

    let mut secs = duration.as_secs();
    let mut out = String::new();
    for (unit, size) in [("h", 3600), ("m", 60)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    out
}

/// Serde adapter for duration strings.
pub mod duration_str {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_human_durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_iso8601_durations() {
        assert_eq!(parse_duration("PT90S").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("PT1M30S").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("pt1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("P1D").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_invalid_durations() {
        for input in ["", "90", "s", "10 parsecs", "PT", "P5", "PT5X", "-5s"] {
            let err = parse_duration(input).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDuration { .. }), "accepted {input:?}");
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(parse_duration(&format_duration(Duration::from_secs(3725))).unwrap(), Duration::from_secs(3725));
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.timeouts.default, Duration::from_secs(90));
        assert_eq!(config.timeouts.disconnection, Duration::from_secs(90));
        assert_eq!(config.timeouts.repair, Duration::from_secs(90));
        assert_eq!(config.timeouts.poll_interval, Duration::from_secs(1));
        assert_eq!(config.settle_delay, Duration::from_secs(5));
        assert_eq!(config.isolation_method, IsolationMethod::Reject);
        assert_eq!(config.load.background, BackgroundPolicy::Join);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
isolation_method = "DROP"
settle_delay = "2s"

[timeouts]
repair = "PT5M"

[load]
background = "detached"

[fault_control]
kind = "iptables"
ssh_user = "root"
"#
        )
        .unwrap();

        let config = HarnessConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.isolation_method, IsolationMethod::Drop);
        assert_eq!(config.settle_delay, Duration::from_secs(2));
        assert_eq!(config.timeouts.repair, Duration::from_secs(300));
        assert_eq!(config.timeouts.disconnection, Duration::from_secs(90));
        assert_eq!(config.load.background, BackgroundPolicy::Detached);
        assert_eq!(
            config.fault_control,
            FaultControlConfig::Iptables {
                ssh_user: Some("root".into()),
                sudo: false
            }
        );
    }

    #[test]
    fn test_bad_duration_in_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[timeouts]\ndefault = \"soon\"").unwrap();
        let err = HarnessConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HarnessConfig::from_toml_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NEXUS_CHAOS_DISCONNECTION_TIMEOUT", "2m"),
            ("NEXUS_CHAOS_ISOLATION_METHOD", "drop"),
            ("NEXUS_CHAOS_BACKGROUND_LOAD", "detached"),
            ("NEXUS_CHAOS_MIN_PEERS", "4"),
            ("NEXUS_CHAOS_NAMESPACE", "openebs"),
        ]);
        let mut config = HarnessConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.timeouts.disconnection, Duration::from_secs(120));
        assert_eq!(config.timeouts.default, Duration::from_secs(90));
        assert_eq!(config.isolation_method, IsolationMethod::Drop);
        assert_eq!(config.load.background, BackgroundPolicy::Detached);
        assert_eq!(config.min_peers, Some(4));
        assert_eq!(config.kubectl.namespace, "openebs");
    }

    #[test]
    fn test_env_invalid_method() {
        let mut config = HarnessConfig::default();
        let err = config
            .apply_env(|key| (key == "NEXUS_CHAOS_ISOLATION_METHOD").then(|| "SEVER".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "NEXUS_CHAOS_ISOLATION_METHOD"));
    }

    #[test]
    fn test_validate_rejects_bad_budgets() {
        let mut config = HarnessConfig::default();
        config.timeouts.repair = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.timeouts.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.timeouts.disconnection = Duration::from_millis(500);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.disconnection"));

        let mut config = HarnessConfig::default();
        config.load.duration = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.min_peers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_configs_follow_timeouts() {
        let mut timeouts = TimeoutConfig::default();
        timeouts.repair = Duration::from_secs(300);
        assert_eq!(timeouts.repair_poll().timeout, Duration::from_secs(300));
        assert_eq!(timeouts.disconnection_poll().interval, Duration::from_secs(1));
        assert!(!timeouts.default_poll().tolerate_errors);
    }
}
