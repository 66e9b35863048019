//! Configuration for jobmaster-core components

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix (`JOBMASTER_SHUFFLE__METRICS_QUERY_TIMEOUT_MS=...`)
const ENV_PREFIX: &str = "JOBMASTER";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier of this coordinator host)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shuffle bridge settings
    #[serde(default)]
    pub shuffle: ShuffleConfig,
}

fn default_node_id() -> String {
    "jobmaster-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            log_level: default_log_level(),
            shuffle: ShuffleConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `JOBMASTER_*`
    /// environment variables. Missing values fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shuffle.metrics_query_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "shuffle.metrics_query_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Shuffle bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Upper bound for one partition metrics fan-out across workers
    #[serde(default = "default_metrics_query_timeout")]
    pub metrics_query_timeout_ms: u64,

    /// Ask producing workers to drop released partitions
    #[serde(default = "default_release_on_workers")]
    pub release_partitions_on_workers: bool,
}

fn default_metrics_query_timeout() -> u64 {
    5_000
}
fn default_release_on_workers() -> bool {
    true
}

impl ShuffleConfig {
    pub fn metrics_query_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_query_timeout_ms)
    }
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            metrics_query_timeout_ms: default_metrics_query_timeout(),
            release_partitions_on_workers: default_release_on_workers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.shuffle.metrics_query_timeout(),
            Duration::from_secs(5)
        );
        assert!(config.shuffle.release_partitions_on_workers);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "jm-test"

[shuffle]
metrics_query_timeout_ms = 250
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "jm-test");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.shuffle.metrics_query_timeout_ms, 250);
        assert!(config.shuffle.release_partitions_on_workers);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[shuffle]\nmetrics_query_timeout_ms = 0").unwrap();

        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfig(_)));
    }
}
