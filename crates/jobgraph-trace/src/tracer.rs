//! Subscriber initialization and configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
    #[error("Invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub format: LogFormat,
    pub with_target: bool,
    pub with_thread_ids: bool,
    /// Write to stderr so stdout stays clean for `--json` output.
    pub to_stderr: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
            with_thread_ids: false,
            to_stderr: true,
        }
    }
}

impl TracingConfig {
    fn env_filter(&self) -> Result<EnvFilter, TracerError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter).map_err(|e| TracerError::Filter {
                filter: self.default_filter.clone(),
                message: e.to_string(),
            }),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracerError> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match (config.format, config.to_stderr) {
        (LogFormat::Pretty, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init(),
        (LogFormat::Json, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init(),
    };

    result.map_err(|e| TracerError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.default_filter, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.to_stderr);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: TracingConfig = serde_yaml::from_str("format: json\n").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn test_invalid_default_filter() {
        let config = TracingConfig {
            default_filter: "jobgraph=loudest".to_string(),
            ..TracingConfig::default()
        };
        // RUST_LOG takes precedence when set in the test environment.
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(config.env_filter(), Err(TracerError::Filter { .. })));
        }
    }
}
