use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, MAX_BATCH_SIZE, MAX_BATCH_TIME};

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let general = &self.general;

        if general.size == 0 || general.size > MAX_BATCH_SIZE {
            anyhow::bail!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                general.size
            );
        }

        if general.time == 0 || general.time > MAX_BATCH_TIME {
            anyhow::bail!(
                "batch time must be between 1 and {MAX_BATCH_TIME} seconds, got {}",
                general.time
            );
        }

        info!("configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordFormat;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert!(config.general.enable);
        assert!(!config.general.batch);
        assert_eq!(config.general.size, 100);
        assert_eq!(config.general.time, 300);
        assert!(config.general.safeshutdown);
    }

    #[test]
    fn test_general_section() {
        let yaml = r#"
general:
  batch: true
  size: 10
  time: 60
  unanswered: true
  congestion: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.general.batch);
        assert_eq!(config.general.size, 10);
        assert_eq!(config.general.time, 60);
        assert!(config.general.unanswered);
        assert!(config.general.congestion);
    }

    #[test]
    fn test_batch_size_out_of_range() {
        let result = Config::from_yaml("general:\n  size: 5000\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("batch size"));
    }

    #[test]
    fn test_batch_time_out_of_range() {
        let result = Config::from_yaml("general:\n  time: 100000\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("batch time"));
    }

    #[test]
    fn test_file_backend_section() {
        let yaml = r#"
backends:
  file:
    path: /var/log/cdr/records.csv
    format: csv
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let file = config.backends.file.unwrap();
        assert_eq!(file.format, RecordFormat::Csv);
        assert!(file.path.ends_with("records.csv"));
    }
}
