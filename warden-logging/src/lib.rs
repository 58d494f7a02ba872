//! Logging initialisation for Warden
//!
//! All crates log through `tracing`; this crate installs the global
//! subscriber once, either from a plain level string or from the
//! `logging` configuration domain.

pub mod init;

pub use init::{active_filter, init_logging_from_config, init_simple_tracing};
