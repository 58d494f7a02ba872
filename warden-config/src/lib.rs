//! Configuration management for Warden
//!
//! Configuration is split by functional domain. Each domain carries its own
//! defaults and validation, and every value can be overridden from the
//! environment using the `WARDEN_` prefix.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    storage::StorageConfig,
    WardenConfig,
};
