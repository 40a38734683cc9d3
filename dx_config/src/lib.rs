//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Describes the server, the collection engine, and every data source

use config::{Config as ConfigBuilder, Environment, File};
use dx_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

mod duration;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub collection: CollectionConfig,
    #[validate(
        length(min = 1, message = "at least one data source must be configured"),
        nested
    )]
    pub sources: Vec<SourceConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    /// Path the metrics scrape is served on
    #[validate(length(min = 1))]
    pub metrics_path: String,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9161,
            metrics_path: "/metrics".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Collection engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct CollectionConfig {
    /// `sequential`, `concurrent` or `hybrid`; anything else falls back to sequential
    pub strategy: String,
    /// Prefix for every exported metric name
    #[validate(length(min = 1))]
    pub namespace: String,
    /// Deadline for one source's collection within a scrape
    #[serde(with = "duration")]
    pub query_timeout: Duration,
    #[serde(with = "duration")]
    pub health_check_interval: Duration,
    #[serde(with = "duration")]
    pub ping_timeout: Duration,
    /// Per-source fan-in buffer
    #[validate(range(min = 1, max = 100000))]
    pub source_buffer: usize,
    /// Scrape-wide merged stream buffer
    #[validate(range(min = 1, max = 100000))]
    pub scrape_buffer: usize,
    /// Custom-metric definitions applied to every source
    pub default_metrics: Option<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            strategy: "sequential".to_string(),
            namespace: "dbexporter".to_string(),
            query_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            source_buffer: 100,
            scrape_buffer: 1000,
            default_metrics: None,
        }
    }
}

/// One data source definition, with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct SourceConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver URL without credentials, e.g. `postgres://db1:5432/app?sslmode=disable`
    #[validate(length(min = 1))]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_open_connections")]
    #[validate(range(min = 1, max = 1000))]
    pub max_open_connections: u32,
    #[serde(default)]
    #[validate(range(max = 1000))]
    pub min_idle_connections: u32,
    #[serde(default, with = "duration::option")]
    pub conn_max_lifetime: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub idle_timeout: Option<Duration>,
    /// 1 is the most important band
    #[serde(default = "default_priority")]
    #[validate(range(min = 1, max = 3))]
    pub priority: u8,
    /// Extra labels as `key=value,key2=value2`
    #[serde(default)]
    #[validate(custom(function = "validate_labels"))]
    pub labels: String,
    /// Custom-metric definitions used only for this source
    #[serde(default)]
    pub custom_metrics: Option<String>,
    /// Overrides the collection-wide query timeout
    #[serde(default, with = "duration::option")]
    pub query_timeout: Option<Duration>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_open_connections() -> u32 {
    10
}

fn default_priority() -> u8 {
    2
}

impl SourceConfig {
    /// Minimal enabled source, mostly useful in tests
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            url: url.into(),
            username: None,
            password: None,
            max_open_connections: default_max_open_connections(),
            min_idle_connections: 0,
            conn_max_lifetime: None,
            idle_timeout: None,
            priority: default_priority(),
            labels: String::new(),
            custom_metrics: None,
            query_timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = labels.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Parsed label pairs
    pub fn label_map(&self) -> Result<BTreeMap<String, String>> {
        parse_labels(&self.labels)
    }

    /// Query timeout for this source, falling back to the collection default
    pub fn effective_query_timeout(&self, default: Duration) -> Duration {
        self.query_timeout.unwrap_or(default)
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("max_open_connections", &self.max_open_connections)
            .field("min_idle_connections", &self.min_idle_connections)
            .field("priority", &self.priority)
            .field("labels", &self.labels)
            .field("custom_metrics", &self.custom_metrics)
            .finish()
    }
}

/// Valid metric and label names in the exposition format
pub const LABEL_NAME_PATTERN: &str = "^[a-zA-Z_][a-zA-Z0-9_]*$";

/// Parse a `key=value,key2=value2` label string
///
/// Whitespace around keys and values is trimmed and empty segments are
/// ignored. A segment without `=`, or whose key is not a valid label name,
/// is an error.
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let names = Regex::new(LABEL_NAME_PATTERN)
        .map_err(|e| Error::Config(format!("label name pattern: {}", e)))?;
    let mut labels = BTreeMap::new();
    for segment in raw.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            Error::Validation(format!("label '{}' is not of the form key=value", segment))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Validation(format!(
                "label '{}' has an empty key",
                segment
            )));
        }
        if !names.is_match(key) {
            return Err(Error::Validation(format!(
                "label key '{}' must match {}",
                key, LABEL_NAME_PATTERN
            )));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}

fn validate_labels(raw: &str) -> std::result::Result<(), ValidationError> {
    parse_labels(raw)
        .map(|_| ())
        .map_err(|_| ValidationError::new("labels"))
}

impl Config {
    /// Load configuration from an optional file and `DBEXPORTER_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9161)?
            .set_default("server.metrics_path", "/metrics")?
            .set_default("server.log_format", "pretty")?
            .set_default("collection.strategy", "sequential")?
            .set_default("collection.namespace", "dbexporter")?
            .set_default("collection.query_timeout", "30s")?
            .set_default("collection.health_check_interval", "30s")?
            .set_default("collection.ping_timeout", "10s")?
            .set_default("collection.source_buffer", 100)?
            .set_default("collection.scrape_buffer", 1000)?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // DBEXPORTER_SERVER__PORT=9200 style overrides (highest priority)
        builder = builder.add_source(
            Environment::with_prefix("DBEXPORTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }

    /// Sources with `enabled = true`
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use test_support::write_temp_file;

    // Use a mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const TWO_SOURCES: &str = r#"
[collection]
strategy = "hybrid"
query_timeout = "5s"

[[sources]]
name = "orders"
url = "postgres://orders-db:5432/orders"
username = "exporter"
password = "hunter2"
priority = 1
labels = "env=prod, team = payments"

[[sources]]
name = "reporting"
url = "mysql://reporting-db:3306/reports"
enabled = false
query_timeout = "2s"
"#;

    #[test]
    fn test_config_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(".toml", TWO_SOURCES);

        let config = Config::load(file.path().to_str()).expect("Should load from file");

        assert_eq!(config.server.port, 9161);
        assert_eq!(config.collection.strategy, "hybrid");
        assert_eq!(config.collection.query_timeout, Duration::from_secs(5));
        assert_eq!(config.collection.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.sources.len(), 2);

        let orders = &config.sources[0];
        assert!(orders.enabled);
        assert_eq!(orders.priority, 1);
        assert_eq!(orders.max_open_connections, 10);
        let labels = orders.label_map().unwrap();
        assert_eq!(labels["env"], "prod");
        assert_eq!(labels["team"], "payments");

        let reporting = &config.sources[1];
        assert!(!reporting.enabled);
        assert_eq!(reporting.priority, 2);
        assert_eq!(
            reporting.effective_query_timeout(config.collection.query_timeout),
            Duration::from_secs(2)
        );
        assert_eq!(config.enabled_sources().count(), 1);
    }

    #[test]
    fn test_config_requires_a_source() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(".toml", "[server]\nport = 9000\n");

        assert!(Config::load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_config_rejects_priority_out_of_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(
            ".toml",
            "[[sources]]\nname = \"a\"\nurl = \"postgres://a/a\"\npriority = 4\n",
        );

        assert!(Config::load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_config_rejects_malformed_labels() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(
            ".toml",
            "[[sources]]\nname = \"a\"\nurl = \"postgres://a/a\"\nlabels = \"env\"\n",
        );

        assert!(Config::load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_config_rejects_invalid_label_keys() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(
            ".toml",
            "[[sources]]\nname = \"a\"\nurl = \"postgres://a/a\"\nlabels = \"my-env=prod\"\n",
        );

        assert!(Config::load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_config_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(".toml", TWO_SOURCES);

        env::set_var("DBEXPORTER_SERVER__PORT", "9400");
        let config = Config::load(file.path().to_str());
        env::remove_var("DBEXPORTER_SERVER__PORT");

        assert_eq!(config.expect("Should load").server.port, 9400);
    }

    #[test]
    fn test_secret_redaction() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let file = write_temp_file(".toml", TWO_SOURCES);

        let config = Config::load(file.path().to_str()).expect("Should load");
        let debug_output = format!("{:?}", config);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }

    #[test]
    fn test_parse_labels() {
        assert!(parse_labels("").unwrap().is_empty());
        assert!(parse_labels(" , ").unwrap().is_empty());

        let labels = parse_labels("region=eu-west-1,tier=gold,").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["region"], "eu-west-1");

        // Empty values are kept; the label injector decides what to do with them
        assert_eq!(parse_labels("datasource=").unwrap()["datasource"], "");

        assert!(parse_labels("novalue").is_err());
        assert!(matches!(parse_labels("my-env=prod"), Err(Error::Validation(_))));
        assert!(parse_labels("1st=a").is_err());

        // Values are free text; escaping happens when the scrape is rendered
        let quoted = parse_labels("note=say \"hi\"").unwrap();
        assert_eq!(quoted["note"], "say \"hi\"");
        assert!(parse_labels("=value").is_err());
    }
}
