//! Registration storage configuration

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where and how the registration database is kept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database file. `None` keeps everything in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Force an in-memory store even when a path is configured
    #[serde(default)]
    pub in_memory: bool,

    /// Database file name inside `path`
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            in_memory: false,
            file_name: default_file_name(),
        }
    }
}

impl StorageConfig {
    /// Storage rooted in `path` on disk
    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Whether this configuration resolves to a non-persistent store
    pub fn is_in_memory(&self) -> bool {
        self.in_memory || self.path.is_none()
    }
}

impl Validatable for StorageConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.file_name, "file_name", self.domain_name())?;

        if self.file_name.contains('/') || self.file_name.contains('\\') {
            return Err(self.validation_error("file_name must not contain path separators"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "storage"
    }
}

fn default_file_name() -> String {
    "registrations.db".to_string()
}
