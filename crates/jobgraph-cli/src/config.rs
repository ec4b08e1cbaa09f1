//! CLI configuration management.

use anyhow::{Context, anyhow, bail};
use jobgraph_trace::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Instances allowed to run at once when neither the definition nor
    /// `--max-workers` sets a limit.
    pub max_workers: usize,
    /// Artifact content directory; the platform data dir when unset.
    pub artifact_dir: Option<PathBuf>,
    /// Retention for uploads that declare none. Unset means never expire.
    pub default_retention_days: Option<u32>,
    pub log_format: LogFormat,
    pub output_format: OutputFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            artifact_dir: None,
            default_retention_days: None,
            log_format: LogFormat::Pretty,
            output_format: OutputFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn project_dirs() -> anyhow::Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "jobgraph", "jobgraph")
        .ok_or_else(|| anyhow!("Could not determine config directory"))
}

impl CliConfig {
    /// Load configuration from the default file.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Save configuration to the default file.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.yaml"))
    }

    /// Artifact directory, falling back to the platform data dir.
    pub fn artifact_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.artifact_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("artifacts")),
        }
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "max_workers" => {
                let workers: usize = value
                    .parse()
                    .with_context(|| format!("Invalid max_workers: {}", value))?;
                if workers == 0 {
                    bail!("max_workers must be at least 1");
                }
                self.max_workers = workers;
            }
            "artifact_dir" => self.artifact_dir = Some(PathBuf::from(value)),
            "default_retention_days" => {
                self.default_retention_days = match value {
                    "" | "none" => None,
                    days => Some(
                        days.parse()
                            .with_context(|| format!("Invalid retention: {}", days))?,
                    ),
                };
            }
            "log_format" => {
                self.log_format = match value {
                    "pretty" => LogFormat::Pretty,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {}", value),
                };
            }
            "output_format" => {
                self.output_format = match value {
                    "text" => OutputFormat::Text,
                    "json" => OutputFormat::Json,
                    _ => bail!("Invalid output format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_values() {
        let mut config = CliConfig::default();
        config.set("max_workers", "8").unwrap();
        config.set("default_retention_days", "7").unwrap();
        config.set("output_format", "json").unwrap();
        config.set("log_format", "json").unwrap();

        assert_eq!(config.max_workers, 8);
        assert_eq!(config.default_retention_days, Some(7));
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.log_format, LogFormat::Json);

        config.set("default_retention_days", "none").unwrap();
        assert_eq!(config.default_retention_days, None);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = CliConfig::default();
        assert!(config.set("max_workers", "0").is_err());
        assert!(config.set("max_workers", "many").is_err());
        assert!(config.set("output_format", "table").is_err());
        assert!(config.set("api_url", "http://localhost").is_err());
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        assert_eq!(CliConfig::load_from(&path).unwrap(), CliConfig::default());

        let mut config = CliConfig::default();
        config.set("artifact_dir", "/var/lib/jobgraph").unwrap();
        config.save_to(&path).unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.artifact_dir().unwrap(), PathBuf::from("/var/lib/jobgraph"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: CliConfig = serde_yaml::from_str("max_workers: 2\n").unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.output_format, OutputFormat::Text);
    }
}
