//! Domain-specific configuration modules

pub mod logging;
pub mod storage;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Warden configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    /// Registration storage configuration
    #[serde(default)]
    pub storage: storage::StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl WardenConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.storage.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = WardenConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WardenConfig::default();
        assert!(config.validate_all().is_ok());
        assert!(config.storage.is_in_memory());
    }

    #[test]
    fn test_sample_round_trips() {
        let sample = WardenConfig::generate_sample();
        let parsed: WardenConfig = serde_yaml::from_str(&sample).unwrap();
        assert_eq!(parsed.storage.file_name, config_default_file_name());
    }

    fn config_default_file_name() -> String {
        storage::StorageConfig::default().file_name
    }
}
