//! Agent configuration

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use streamwatch_core::config::PipelineConfig;
use streamwatch_core::ingest::SourceConfig;

pub const DEFAULT_CONFIG_PATH: &str = "streamwatch.toml";
const ENV_PREFIX: &str = "STREAMWATCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Instance name attached to every structured log
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port for the read API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Which stream source to run
    #[serde(default)]
    pub stream: SourceConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "streamwatch".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl AgentConfig {
    /// Load from the TOML file at `path` (optional when not given) and the
    /// `STREAMWATCH__*` environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// As [`AgentConfig::load`], reading variables from `env` instead of the
    /// process environment when given
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let config: AgentConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config
            .pipeline
            .validate()
            .context("invalid pipeline configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AgentConfig::load_with_env(None, Some(HashMap::new())).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.stream.mode(), "synthetic");
        assert_eq!(config.pipeline.zscore.threshold, 3.0);
    }

    #[test]
    fn test_file_sets_source_and_pipeline() {
        let file = write_toml(
            r#"
instance = "edge-1"
api_port = 9100
log_format = "pretty"

[stream]
mode = "http"
urls = ["http://localhost:8000/health"]
interval_secs = 2

[pipeline.zscore]
threshold = 2.5

[pipeline.alerts]
cooldown_secs = 120
"#,
        );
        let config = AgentConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
        assert_eq!(config.instance, "edge-1");
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.stream.mode(), "http");
        assert_eq!(config.pipeline.zscore.threshold, 2.5);
        assert_eq!(config.pipeline.alerts.cooldown_secs, 120);
        // Untouched sections keep their defaults
        assert_eq!(config.pipeline.window.max_records, 1000);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_toml("api_port = 9100\n");
        let env = HashMap::from([
            ("STREAMWATCH__API_PORT".to_string(), "9200".to_string()),
            (
                "STREAMWATCH__PIPELINE__ZSCORE__THRESHOLD".to_string(),
                "4".to_string(),
            ),
        ]);
        let config = AgentConfig::load_with_env(Some(file.path()), Some(env)).unwrap();
        assert_eq!(config.api_port, 9200);
        assert_eq!(config.pipeline.zscore.threshold, 4.0);
    }

    #[test]
    fn test_invalid_pipeline_rejected() {
        let file = write_toml("[pipeline.window]\nmax_records = 1\n");
        let err = AgentConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap_err();
        assert!(format!("{err:#}").contains("max_records"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let missing = Path::new("/definitely/not/here/streamwatch.toml");
        assert!(AgentConfig::load_with_env(Some(missing), Some(HashMap::new())).is_err());
    }
}
