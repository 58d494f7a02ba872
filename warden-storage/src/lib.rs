//! Durable registration storage for Warden
//!
//! Registrations, their resource records and the resource-id ledgers live in
//! an ordered key-value table. `RegistrationDatabase` implements the record
//! semantics on top of a `KeyValueStore`; `RegistrationStore` runs one
//! database on its own task so callers never touch the backing store
//! directly.

pub mod database;
pub mod error;
pub mod keys;
pub mod kv;
pub mod records;
pub mod store;

// Re-export commonly used types
pub use database::RegistrationDatabase;
pub use error::{StorageError, StorageResult};
pub use kv::{KeyValueStore, SqliteKvStore, WriteBatch};
pub use records::{
    origin_of, NextAvailableIds, RegistrationData, RegistrationId, ResourceId, ResourceRecord,
    StorageLocation, VersionId,
};
pub use store::RegistrationStore;
