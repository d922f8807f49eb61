//! Configuration file parsing and structures.
//!
//! homelink reads one or more TOML files. Tables from later files are merged
//! into earlier ones; setting the same key to two different values is an
//! error.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::bridge::Instance;
use crate::sandbox::SandboxOptions;
use crate::sandbox::DEFAULT_COMMAND;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub automation: Option<AutomationConfig>,
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

#[derive(
    Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `tower_http = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build a target filter, with `level` taking precedence over the
    /// configured default level when given.
    pub fn targets(&self, level: Option<LogLevel>) -> Targets {
        let default = level.unwrap_or(self.level);
        self.overrides
            .iter()
            .fold(Targets::new().with_default(default), |targets, (target, level)| {
                targets.with_target(target.clone(), *level)
            })
    }
}

/// Upstream control service connection
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket URL, `wss://...`
    pub url: String,

    pub api_key: String,

    /// Accept self-signed certificates
    #[serde(default)]
    pub development: bool,

    /// Quiet period after the last discovered instance before the first
    /// device list is sent
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
}

impl UpstreamConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

fn default_settle_delay_secs() -> u64 {
    4
}

/// Local HAP accessory servers
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    /// Setup PIN, looked up in Homebridge's config.json when absent
    #[serde(default)]
    pub pin: Option<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pin: None,
            poll_interval_secs: default_poll_interval_secs(),
            instances: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// User automation script
#[derive(Debug, Deserialize)]
pub struct AutomationConfig {
    pub script: PathBuf,

    /// Runtime command line. `{entry}` and `{memory_mb}` are substituted.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl AutomationConfig {
    pub fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            compile_timeout: Duration::from_secs(self.compile_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_restarts: self.max_restarts,
        }
    }
}

fn default_command() -> Vec<String> {
    DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect()
}

fn default_memory_limit_mb() -> u64 {
    128
}

fn default_call_timeout_secs() -> u64 {
    5
}

fn default_compile_timeout_secs() -> u64 {
    10
}

fn default_max_restarts() -> u32 {
    3
}

/// Local status API
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8581
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_files(&[path.as_ref().to_path_buf()])
    }

    /// Load and merge several TOML files, in order.
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in paths {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
            let table: toml::Table = toml::from_str(&contents)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
            merge(&mut merged, table, "", path)?;
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(ConfigError::Invalid)
    }
}

fn merge(into: &mut toml::Table, from: toml::Table, prefix: &str, path: &Path) -> Result<(), ConfigError> {
    for (key, value) in from {
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match (into.get_mut(&key), value) {
            (None, value) => {
                into.insert(key, value);
            }
            (Some(toml::Value::Table(existing)), toml::Value::Table(table)) => {
                merge(existing, table, &dotted, path)?;
            }
            (Some(toml::Value::Array(existing)), toml::Value::Array(items))
                if existing.iter().all(toml::Value::is_table) && items.iter().all(toml::Value::is_table) =>
            {
                existing.extend(items);
            }
            (Some(existing), value) if *existing == value => {}
            (Some(_), _) => {
                return Err(ConfigError::Conflict {
                    key: dotted,
                    path: path.to_path_buf(),
                })
            }
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("{key} in {path} conflicts with an earlier config file")]
    Conflict { key: String, path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Invalid(#[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [upstream]
        url = "wss://control.example.com/bridge"
        api_key = "secret"
    "#;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.upstream.settle_delay(), Duration::from_secs(4));
        assert!(!config.upstream.development);
        assert_eq!(config.bridge.pin, None);
        assert_eq!(config.bridge.poll_interval(), Duration::from_secs(5));
        assert!(config.bridge.instances.is_empty());
        assert!(config.automation.is_none());
        assert!(config.api.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"
            overrides = { tower_http = "warn" }

            [upstream]
            url = "wss://localhost:8443/bridge"
            api_key = "dev"
            development = true
            settle_delay_secs = 1

            [bridge]
            pin = "031-45-154"
            poll_interval_secs = 2

            [[bridge.instances]]
            name = "Homebridge"
            host = "127.0.0.1"
            port = 51826
            username = "0E:12:34:56:78:9A"

            [automation]
            script = "automations/lights.js"
            memory_limit_mb = 64
            max_restarts = 1

            [api]
            port = 9000
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.overrides["tower_http"], LogLevel::Warn);
        assert!(config.upstream.development);
        assert_eq!(config.bridge.pin.as_deref(), Some("031-45-154"));
        assert_eq!(config.bridge.instances[0].port, 51826);

        let automation = config.automation.unwrap();
        assert_eq!(automation.command, default_command());
        assert_eq!(automation.memory_limit_mb, 64);
        let options = automation.sandbox_options();
        assert_eq!(options.call_timeout, Duration::from_secs(5));
        assert_eq!(options.max_restarts, 1);

        let api = config.api.unwrap();
        assert_eq!(api.listen, "127.0.0.1");
        assert_eq!(api.port, 9000);
    }

    #[test]
    fn test_missing_upstream_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "homelink.toml", "[logging]\nlevel = \"warn\"\n");
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_merge_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(&dir, "base.toml", MINIMAL);
        let local = write(
            &dir,
            "local.toml",
            r#"
            [upstream]
            url = "wss://control.example.com/bridge"
            development = true

            [[bridge.instances]]
            name = "A"
            host = "10.0.0.2"
            port = 51826
            username = "AA:AA:AA:AA:AA:AA"
            "#,
        );
        let more = write(
            &dir,
            "more.toml",
            r#"
            [[bridge.instances]]
            name = "B"
            host = "10.0.0.3"
            port = 51827
            username = "BB:BB:BB:BB:BB:BB"
            "#,
        );

        let config = Config::from_files(&[base, local, more]).unwrap();
        assert_eq!(config.upstream.api_key, "secret");
        assert!(config.upstream.development);
        let names: Vec<_> = config.bridge.instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_merge_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(&dir, "base.toml", MINIMAL);
        let other = write(&dir, "other.toml", "[upstream]\napi_key = \"different\"\n");

        match Config::from_files(&[base, other.clone()]) {
            Err(ConfigError::Conflict { key, path }) => {
                assert_eq!(key, "upstream.api_key");
                assert_eq!(path, other);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "broken.toml", "[upstream\n");
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(ref p, _) if *p == path));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_log_targets() {
        let mut logging = LoggingConfig::default();
        logging
            .overrides
            .insert("homelink::upstream".to_string(), LogLevel::Trace);

        let targets = logging.targets(None);
        assert!(targets.would_enable("homelink::upstream::client", &tracing::Level::TRACE));
        assert!(!targets.would_enable("homelink::bridge", &tracing::Level::DEBUG));

        let targets = logging.targets(Some(LogLevel::Debug));
        assert!(targets.would_enable("homelink::bridge", &tracing::Level::DEBUG));
    }
}
