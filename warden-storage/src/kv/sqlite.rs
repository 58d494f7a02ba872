use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Schema, Set, TransactionTrait,
};
use std::time::Duration;
use tracing::{debug, info};

use super::entities::kv_entries;
use super::{BatchOperation, KeyValueStore, WriteBatch};
use crate::error::{StorageError, StorageResult};
use crate::records::StorageLocation;

/// Key-value store kept in a single SQLite table through sea-orm
#[derive(Clone)]
pub struct SqliteKvStore {
    connection: DatabaseConnection,
}

impl SqliteKvStore {
    /// Open (creating if necessary) the store at `location`
    pub async fn open(location: &StorageLocation) -> StorageResult<Self> {
        let url = match location {
            StorageLocation::InMemory => {
                debug!("Using in-memory registration database");
                "sqlite::memory:".to_string()
            }
            StorageLocation::OnDisk { directory, .. } => {
                tokio::fs::create_dir_all(directory).await?;
                let path = location
                    .database_path()
                    .ok_or_else(|| StorageError::Io("missing database path".to_string()))?;
                info!("Opening registration database at {:?}", path);
                format!("sqlite://{}?mode=rwc", path.display())
            }
        };

        let connection = Database::connect(connect_options(location, url)).await?;
        let store = Self { connection };
        store.ensure_table().await?;
        Ok(store)
    }

    /// Whether an on-disk store already exists at `location`
    pub async fn exists(location: &StorageLocation) -> bool {
        match location.database_path() {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }

    async fn ensure_table(&self) -> StorageResult<()> {
        let backend = self.connection.get_database_backend();
        let mut statement = Schema::new(backend).create_table_from_entity(kv_entries::Entity);
        statement.if_not_exists();
        self.connection.execute(backend.build(&statement)).await?;
        Ok(())
    }
}

/// Lifetime given to the single in-memory connection. The pool would
/// otherwise reap it after its idle or lifetime defaults and reconnect to a
/// fresh, empty database.
const IN_MEMORY_CONNECTION_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

// One connection: an in-memory database lives and dies with it
fn connect_options(location: &StorageLocation, url: String) -> ConnectOptions {
    let mut options = ConnectOptions::new(url);
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    if matches!(location, StorageLocation::InMemory) {
        options
            .idle_timeout(IN_MEMORY_CONNECTION_LIFETIME)
            .max_lifetime(IN_MEMORY_CONNECTION_LIFETIME);
    }
    options
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let row = kv_entries::Entity::find_by_id(key.to_string())
            .one(&self.connection)
            .await?;
        Ok(row.map(|row| row.value))
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        // LIKE is case-insensitive and treats '_' as a wildcard, so recheck
        let rows = kv_entries::Entity::find()
            .filter(kv_entries::Column::Key.starts_with(prefix))
            .order_by_asc(kv_entries::Column::Key)
            .all(&self.connection)
            .await?;

        Ok(rows
            .into_iter()
            .filter(|row| row.key.starts_with(prefix))
            .map(|row| (row.key, row.value))
            .collect())
    }

    async fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let txn = self.connection.begin().await?;
        for operation in batch.into_operations() {
            match operation {
                BatchOperation::Put { key, value } => {
                    kv_entries::Entity::insert(kv_entries::ActiveModel {
                        key: Set(key),
                        value: Set(value),
                    })
                    .on_conflict(
                        OnConflict::column(kv_entries::Column::Key)
                            .update_column(kv_entries::Column::Value)
                            .to_owned(),
                    )
                    .exec_without_returning(&txn)
                    .await?;
                }
                BatchOperation::Delete { key } => {
                    kv_entries::Entity::delete_by_id(key).exec(&txn).await?;
                }
            }
        }
        txn.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_put_delete_and_scan() {
        let store = SqliteKvStore::open(&StorageLocation::InMemory).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("REG:b", "2");
        batch.put("REG:a", "1");
        batch.put("RES:x", "x");
        batch.put("REG:a", "updated");
        store.write(batch).await.unwrap();

        let rows = store.scan_prefix("REG:").await.unwrap();
        assert_eq!(
            rows,
            vec![
                ("REG:a".to_string(), "updated".to_string()),
                ("REG:b".to_string(), "2".to_string()),
            ]
        );

        let mut batch = WriteBatch::new();
        batch.delete("REG:a");
        store.write(batch).await.unwrap();
        assert_eq!(store.get("REG:a").await.unwrap(), None);
        assert_eq!(store.get("RES:x").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_scan_is_case_and_wildcard_exact() {
        let store = SqliteKvStore::open(&StorageLocation::InMemory).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("reg:lower", "no");
        batch.put("REGX_", "no");
        batch.put("REG_", "yes");
        store.write(batch).await.unwrap();

        let rows = store.scan_prefix("REG_").await.unwrap();
        assert_eq!(rows, vec![("REG_".to_string(), "yes".to_string())]);
    }

    #[test]
    fn test_in_memory_connection_is_never_reaped() {
        let options = connect_options(&StorageLocation::InMemory, "sqlite::memory:".to_string());
        assert_eq!(options.get_max_connections(), Some(1));
        assert_eq!(options.get_min_connections(), Some(1));
        assert_eq!(
            options.get_idle_timeout(),
            Some(IN_MEMORY_CONNECTION_LIFETIME)
        );
        assert_eq!(
            options.get_max_lifetime(),
            Some(IN_MEMORY_CONNECTION_LIFETIME)
        );
        assert!(IN_MEMORY_CONNECTION_LIFETIME >= Duration::from_secs(365 * 24 * 60 * 60));
    }

    #[tokio::test]
    async fn test_on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let location = StorageLocation::OnDisk {
            directory: dir.path().join("nested"),
            file_name: "kv.db".to_string(),
        };
        assert!(!SqliteKvStore::exists(&location).await);

        {
            let store = SqliteKvStore::open(&location).await.unwrap();
            let mut batch = WriteBatch::new();
            batch.put("INITDATA_DB_VERSION", "1");
            store.write(batch).await.unwrap();
        }

        assert!(SqliteKvStore::exists(&location).await);
        let reopened = SqliteKvStore::open(&location).await.unwrap();
        assert_eq!(
            reopened.get("INITDATA_DB_VERSION").await.unwrap().as_deref(),
            Some("1")
        );
    }
}
