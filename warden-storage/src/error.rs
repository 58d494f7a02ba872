//! Storage error types

use thiserror::Error;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the registration store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// No record for the requested registration
    #[error("Registration not found")]
    NotFound,

    /// The store hit an unrecoverable error earlier and rejects all work
    #[error("Registration database is disabled")]
    Disabled,

    /// Stored data could not be decoded
    #[error("Registration database is corrupted: {0}")]
    Corrupted(String),

    /// Backing store failure
    #[error("Database error: {0}")]
    Database(String),

    /// Filesystem failure while preparing the store location
    #[error("IO error: {0}")]
    Io(String),

    /// The caller handed over data that cannot be stored
    #[error("Invalid registration data: {0}")]
    InvalidData(String),
}

impl StorageError {
    /// Whether this error takes the whole store out of service
    pub fn disables_store(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupted(_) | StorageError::Database(_) | StorageError::Io(_)
        )
    }
}

impl From<sea_orm::DbErr> for StorageError {
    fn from(err: sea_orm::DbErr) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
