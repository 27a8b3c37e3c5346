//! Shield configuration.
//!
//! Loaded once at startup from TOML and immutable afterwards. Keys that drive
//! blocking decisions have no defaults: a missing or invalid value is a
//! startup error, never a silent fallback.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShieldError, ShieldResult};

/// Threshold rule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Attempts within the window that trigger a block.
    pub threshold: u32,
    /// Sliding window length in minutes.
    pub time_window_minutes: u64,
    /// Name recorded as the reason of rule-issued blocks.
    #[serde(default = "default_rule_name")]
    pub rule_name: String,
}

fn default_rule_name() -> String {
    "auth-failure".to_string()
}

/// Block duration and enforcement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingConfig {
    /// Duration of a first block, in minutes.
    pub base_duration_minutes: u64,
    /// Growth factor applied per prior offense.
    pub multiplier: f64,
    /// Upper bound for any block, in minutes.
    pub max_block_duration_minutes: u64,
    /// Addresses that are never blocked.
    pub allowlist: BTreeSet<IpAddr>,
    /// Expiry assumed for addresses found in the filter without a block record.
    #[serde(default = "default_unknown_block_minutes")]
    pub unknown_block_default_minutes: u64,
    /// Interval between expiry sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

const fn default_unknown_block_minutes() -> u64 {
    24 * 60
}

const fn default_sweep_interval_secs() -> u64 {
    5
}

/// Event source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Substrings that mark a log message as an authentication failure.
    pub keywords: Vec<String>,
    /// Journal `SYSLOG_IDENTIFIER` values to follow (empty = all).
    #[serde(default)]
    pub syslog_identifiers: Vec<String>,
}

/// Persistent store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the `SQLite` database file.
    pub path: PathBuf,
}

/// Packet-filter backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Linux nftables via the `nft` command.
    #[default]
    Nftables,
    /// In-process set; nothing is dropped on the wire (dry run).
    Memory,
}

/// Packet-filter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Which backend enforces blocks.
    #[serde(default)]
    pub backend: FilterKind,
    /// nftables table name (family `inet`).
    #[serde(default = "default_table")]
    pub table: String,
    /// Timeout for a single filter command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_table() -> String {
    "claw_shield".to_string()
}

const fn default_command_timeout_secs() -> u64 {
    5
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            backend: FilterKind::default(),
            table: default_table(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Parameters of the escalating block duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationPolicy {
    /// Duration of a first block.
    pub base: Duration,
    /// Growth factor per prior offense.
    pub multiplier: f64,
    /// Upper bound for any block.
    pub max: Duration,
}

/// Main shield configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Threshold rule.
    pub rules: RulesConfig,
    /// Block durations and allow-list.
    pub blocking: BlockingConfig,
    /// Event source filters.
    pub monitoring: MonitoringConfig,
    /// Persistent store.
    pub database: DatabaseConfig,
    /// Packet filter.
    #[serde(default)]
    pub filter: FilterConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ShieldConfig {
    /// Create a new builder seeded with [`ShieldConfig::sample`].
    #[must_use]
    pub fn builder() -> ShieldConfigBuilder {
        ShieldConfigBuilder {
            config: Self::sample(),
        }
    }

    /// A complete configuration suitable as a starting point.
    #[must_use]
    pub fn sample() -> Self {
        Self {
            rules: RulesConfig {
                threshold: 5,
                time_window_minutes: 10,
                rule_name: default_rule_name(),
            },
            blocking: BlockingConfig {
                base_duration_minutes: 10,
                multiplier: 2.0,
                max_block_duration_minutes: 24 * 60,
                allowlist: BTreeSet::from([IpAddr::from([127, 0, 0, 1])]),
                unknown_block_default_minutes: default_unknown_block_minutes(),
                sweep_interval_secs: default_sweep_interval_secs(),
            },
            monitoring: MonitoringConfig {
                keywords: vec![
                    "Failed password".to_string(),
                    "Invalid user".to_string(),
                    "authentication failure".to_string(),
                ],
                syslog_identifiers: vec!["sshd".to_string()],
            },
            database: DatabaseConfig {
                path: PathBuf::from("/var/lib/claw-shield/shield.db"),
            },
            filter: FilterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> ShieldResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ShieldError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> ShieldResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ShieldError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> ShieldResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ShieldError::Config(format!("failed to render TOML: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> ShieldResult<()> {
        if self.rules.threshold == 0 {
            return Err(ShieldError::Config(
                "rules.threshold must be at least 1".to_string(),
            ));
        }

        if self.rules.time_window_minutes == 0 {
            return Err(ShieldError::Config(
                "rules.time_window_minutes must be greater than 0".to_string(),
            ));
        }

        if self.rules.rule_name.trim().is_empty() {
            return Err(ShieldError::Config(
                "rules.rule_name cannot be empty".to_string(),
            ));
        }

        if self.blocking.base_duration_minutes == 0 {
            return Err(ShieldError::Config(
                "blocking.base_duration_minutes must be greater than 0".to_string(),
            ));
        }

        if !self.blocking.multiplier.is_finite() || self.blocking.multiplier < 1.0 {
            return Err(ShieldError::Config(
                "blocking.multiplier must be a finite number >= 1".to_string(),
            ));
        }

        if self.blocking.max_block_duration_minutes == 0 {
            return Err(ShieldError::Config(
                "blocking.max_block_duration_minutes must be greater than 0".to_string(),
            ));
        }

        if self.blocking.unknown_block_default_minutes == 0 {
            return Err(ShieldError::Config(
                "blocking.unknown_block_default_minutes must be greater than 0".to_string(),
            ));
        }

        if self.blocking.sweep_interval_secs == 0 {
            return Err(ShieldError::Config(
                "blocking.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.monitoring.keywords.is_empty() {
            return Err(ShieldError::Config(
                "monitoring.keywords must contain at least one keyword".to_string(),
            ));
        }

        // A blank keyword matches every log line.
        if self.monitoring.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ShieldError::Config(
                "monitoring.keywords cannot contain blank entries".to_string(),
            ));
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(ShieldError::Config(
                "database.path cannot be empty".to_string(),
            ));
        }

        if self.filter.table.is_empty()
            || !self
                .filter
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ShieldError::Config(
                "filter.table must be non-empty and contain only alphanumerics and underscores"
                    .to_string(),
            ));
        }

        if self.filter.command_timeout_secs == 0 {
            return Err(ShieldError::Config(
                "filter.command_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if an address is on the allow-list.
    #[must_use]
    pub fn is_allowlisted(&self, address: &IpAddr) -> bool {
        self.blocking.allowlist.contains(address)
    }

    /// The sliding window used for attempt counting.
    #[must_use]
    pub const fn time_window(&self) -> Duration {
        minutes(self.rules.time_window_minutes)
    }

    /// Escalation parameters derived from the blocking section.
    #[must_use]
    pub const fn escalation(&self) -> EscalationPolicy {
        EscalationPolicy {
            base: minutes(self.blocking.base_duration_minutes),
            multiplier: self.blocking.multiplier,
            max: minutes(self.blocking.max_block_duration_minutes),
        }
    }

    /// Expiry assumed for filter members without a block record.
    #[must_use]
    pub const fn unknown_block_default(&self) -> Duration {
        minutes(self.blocking.unknown_block_default_minutes)
    }

    /// Interval between expiry sweeps.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.blocking.sweep_interval_secs)
    }

    /// Timeout applied to each filter command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.filter.command_timeout_secs)
    }
}

/// Convert whole minutes to a duration, saturating on overflow.
#[must_use]
pub const fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

/// Builder for `ShieldConfig`.
#[derive(Debug, Clone)]
pub struct ShieldConfigBuilder {
    config: ShieldConfig,
}

impl ShieldConfigBuilder {
    /// Set the attempt threshold.
    #[must_use]
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.config.rules.threshold = threshold;
        self
    }

    /// Set the counting window in minutes.
    #[must_use]
    pub fn time_window_minutes(mut self, minutes: u64) -> Self {
        self.config.rules.time_window_minutes = minutes;
        self
    }

    /// Set the escalation parameters (minutes, factor, minutes).
    #[must_use]
    pub fn escalation(mut self, base_minutes: u64, multiplier: f64, max_minutes: u64) -> Self {
        self.config.blocking.base_duration_minutes = base_minutes;
        self.config.blocking.multiplier = multiplier;
        self.config.blocking.max_block_duration_minutes = max_minutes;
        self
    }

    /// Add an allow-listed address.
    #[must_use]
    pub fn allow(mut self, address: IpAddr) -> Self {
        self.config.blocking.allowlist.insert(address);
        self
    }

    /// Set the sweep interval in seconds.
    #[must_use]
    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.blocking.sweep_interval_secs = secs;
        self
    }

    /// Set the database path.
    #[must_use]
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database.path = path.into();
        self
    }

    /// Set the filter backend.
    #[must_use]
    pub fn filter_backend(mut self, backend: FilterKind) -> Self {
        self.config.filter.backend = backend;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ShieldConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    const MINIMAL: &str = r#"
        [rules]
        threshold = 5
        time_window_minutes = 10

        [blocking]
        base_duration_minutes = 10
        multiplier = 2.0
        max_block_duration_minutes = 60
        allowlist = ["127.0.0.1", "::1"]

        [monitoring]
        keywords = ["Failed password"]

        [database]
        path = "/tmp/shield.db"
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = ShieldConfig::from_toml(MINIMAL).expect("should parse minimal config");

        assert_eq!(config.rules.threshold, 5);
        assert_eq!(config.rules.rule_name, "auth-failure");
        assert_eq!(config.time_window(), Duration::from_secs(600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.unknown_block_default(), Duration::from_secs(24 * 3600));
        assert_eq!(config.filter.backend, FilterKind::Nftables);
        assert_eq!(config.filter.table, "claw_shield");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.monitoring.syslog_identifiers.is_empty());
        assert!(config.is_allowlisted(&"127.0.0.1".parse().expect("addr")));
        assert!(config.is_allowlisted(&"::1".parse().expect("addr")));
        assert!(!config.is_allowlisted(&"10.0.0.5".parse().expect("addr")));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [rules]
            threshold = 3
            time_window_minutes = 5
            rule_name = "sshd-bruteforce"

            [blocking]
            base_duration_minutes = 15
            multiplier = 1.5
            max_block_duration_minutes = 720
            allowlist = []
            unknown_block_default_minutes = 60
            sweep_interval_secs = 2

            [monitoring]
            keywords = ["Failed password", "Invalid user"]
            syslog_identifiers = ["sshd"]

            [database]
            path = "/var/lib/claw-shield/shield.db"

            [filter]
            backend = "memory"
            table = "edge_shield"
            command_timeout_secs = 3

            [logging]
            level = "debug"
            format = "json"
        "#;

        let config = ShieldConfig::from_toml(toml).expect("should parse full config");

        assert_eq!(config.rules.rule_name, "sshd-bruteforce");
        assert_eq!(config.filter.backend, FilterKind::Memory);
        assert_eq!(config.filter.table, "edge_shield");
        assert_eq!(config.command_timeout(), Duration::from_secs(3));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        let escalation = config.escalation();
        assert_eq!(escalation.base, Duration::from_secs(15 * 60));
        assert!((escalation.multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(escalation.max, Duration::from_secs(720 * 60));
    }

    #[test]
    fn test_missing_required_key_is_rejected() {
        let toml = MINIMAL.replace("threshold = 5", "");
        let err = ShieldConfig::from_toml(&toml).expect_err("threshold is required");
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_missing_allowlist_is_rejected() {
        let toml = MINIMAL.replace(r#"allowlist = ["127.0.0.1", "::1"]"#, "");
        assert!(ShieldConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_invalid_allowlist_entry_is_rejected() {
        let toml = MINIMAL.replace("127.0.0.1", "not-an-address");
        assert!(ShieldConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let toml = MINIMAL.replace("threshold = 5", "threshold = 0");
        let err = ShieldConfig::from_toml(&toml).expect_err("zero threshold");
        assert!(err.to_string().contains("rules.threshold"));
    }

    #[test]
    fn test_multiplier_below_one_is_rejected() {
        let toml = MINIMAL.replace("multiplier = 2.0", "multiplier = 0.5");
        let err = ShieldConfig::from_toml(&toml).expect_err("shrinking multiplier");
        assert!(err.to_string().contains("multiplier"));
    }

    #[test]
    fn test_empty_keywords_are_rejected() {
        let toml = MINIMAL.replace(r#"keywords = ["Failed password"]"#, "keywords = []");
        assert!(ShieldConfig::from_toml(&toml).is_err());
    }

    #[test_case(r#"keywords = ["Failed password", ""]"# ; "empty entry")]
    #[test_case(r#"keywords = ["  ", "Invalid user"]"# ; "whitespace entry")]
    fn test_blank_keyword_is_rejected(keywords: &str) {
        let toml = MINIMAL.replace(r#"keywords = ["Failed password"]"#, keywords);
        let err = ShieldConfig::from_toml(&toml).expect_err("blank keyword");
        assert!(err.to_string().contains("blank"));
    }

    #[test]
    fn test_bad_table_name_is_rejected() {
        let config = ShieldConfig {
            filter: FilterConfig {
                table: "drop; flush ruleset".into(),
                ..FilterConfig::default()
            },
            ..ShieldConfig::sample()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_above_max_is_allowed() {
        let toml = MINIMAL.replace("base_duration_minutes = 10", "base_duration_minutes = 90");
        assert!(ShieldConfig::from_toml(&toml).is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(MINIMAL.as_bytes())
            .expect("failed to write temp file");

        let config = ShieldConfig::from_file(file.path()).expect("should load from file");
        assert_eq!(config.rules.threshold, 5);
    }

    #[test]
    fn test_from_missing_file() {
        let err = ShieldConfig::from_file("/nonexistent/claw-shield.toml")
            .expect_err("missing file");
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_sample_round_trips_through_toml() {
        let sample = ShieldConfig::sample();
        let rendered = sample.to_toml().expect("should render");
        let parsed = ShieldConfig::from_toml(&rendered).expect("should parse rendered sample");
        assert_eq!(parsed, sample);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ShieldConfig::builder()
            .threshold(1)
            .time_window_minutes(3)
            .escalation(1, 1.0, 5)
            .allow("192.0.2.1".parse().expect("addr"))
            .sweep_interval_secs(1)
            .database_path("/tmp/x.db")
            .filter_backend(FilterKind::Memory)
            .build();

        assert!(config.validate().is_ok());
        assert_eq!(config.rules.threshold, 1);
        assert_eq!(config.time_window(), Duration::from_secs(180));
        assert!(config.is_allowlisted(&"192.0.2.1".parse().expect("addr")));
        assert!(config.is_allowlisted(&"127.0.0.1".parse().expect("addr")));
        assert_eq!(config.filter.backend, FilterKind::Memory);
    }
}
