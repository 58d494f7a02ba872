//! Ordered key-value backing store

pub mod entities;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageResult;

pub use sqlite::SqliteKvStore;

/// One mutation inside a `WriteBatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Mutations applied atomically, in order
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    operations: Vec<BatchOperation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.operations.push(BatchOperation::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.operations
            .push(BatchOperation::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn into_operations(self) -> Vec<BatchOperation> {
        self.operations
    }
}

/// Storage the registration database is layered on
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Point read
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Every entry whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>>;

    /// Apply `batch` atomically
    async fn write(&self, batch: WriteBatch) -> StorageResult<()>;
}
