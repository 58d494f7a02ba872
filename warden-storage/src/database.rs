//! Registration records on top of an ordered key-value store

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, error, info};

use crate::error::{StorageError, StorageResult};
use crate::keys::{self, PURGEABLE_RESOURCE_PREFIX, UNCOMMITTED_RESOURCE_PREFIX};
use crate::kv::{KeyValueStore, SqliteKvStore, WriteBatch};
use crate::records::{
    origin_of, NextAvailableIds, RegistrationData, RegistrationId, ResourceId, ResourceRecord,
    StorageLocation, VersionId,
};

/// Schema version written on the first real write
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Registration database.
///
/// Not shareable: exactly one task owns it (see `RegistrationStore`). The
/// backing store is opened lazily. Read-only calls never create it, so an
/// untouched location stays empty.
///
/// Any backing store failure disables the database for the rest of its
/// life; undecodable data additionally sets the corruption flag.
pub struct RegistrationDatabase {
    location: StorageLocation,
    store: Option<Box<dyn KeyValueStore>>,
    next_ids: NextAvailableIds,
    is_initialized: bool,
    is_disabled: bool,
    was_corruption_detected: bool,
}

impl RegistrationDatabase {
    pub fn new(location: StorageLocation) -> Self {
        Self {
            location,
            store: None,
            next_ids: NextAvailableIds::default(),
            is_initialized: false,
            is_disabled: false,
            was_corruption_detected: false,
        }
    }

    /// Database over an already opened store
    pub async fn with_store(store: Box<dyn KeyValueStore>) -> StorageResult<Self> {
        let mut database = Self::new(StorageLocation::InMemory);
        database.store = Some(store);
        database.load_next_available_ids().await?;
        Ok(database)
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.is_disabled
    }

    pub fn was_corruption_detected(&self) -> bool {
        self.was_corruption_detected
    }

    /// Open the backing store if needed. Returns `Ok(false)` when it does
    /// not exist yet and `create_if_needed` is false.
    pub async fn lazy_open(&mut self, create_if_needed: bool) -> StorageResult<bool> {
        if self.is_disabled {
            return Err(StorageError::Disabled);
        }
        if self.store.is_some() {
            return Ok(true);
        }

        let exists = SqliteKvStore::exists(&self.location).await;
        if !create_if_needed && !exists {
            // An in-memory store never exists before its first write
            return Ok(false);
        }

        let opened = SqliteKvStore::open(&self.location).await;
        let store = self.check(opened)?;
        self.store = Some(Box::new(store));
        self.load_next_available_ids().await?;
        Ok(true)
    }

    pub async fn get_next_available_ids(&mut self) -> StorageResult<NextAvailableIds> {
        if !self.lazy_open(false).await? {
            return Ok(NextAvailableIds::default());
        }
        Ok(self.next_ids)
    }

    pub async fn get_origins_with_registrations(&mut self) -> StorageResult<BTreeSet<String>> {
        if !self.lazy_open(false).await? {
            return Ok(BTreeSet::new());
        }

        let entries = self.scan(keys::UNIQUE_ORIGIN_PREFIX).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| {
                key.strip_prefix(keys::UNIQUE_ORIGIN_PREFIX)
                    .map(str::to_string)
            })
            .collect())
    }

    pub async fn get_registrations_for_origin(
        &mut self,
        origin: &str,
    ) -> StorageResult<Vec<RegistrationData>> {
        if !self.lazy_open(false).await? {
            return Ok(Vec::new());
        }
        self.read_registrations(&keys::registration_key_prefix(origin))
            .await
    }

    pub async fn get_all_registrations(&mut self) -> StorageResult<Vec<RegistrationData>> {
        if !self.lazy_open(false).await? {
            return Ok(Vec::new());
        }
        self.read_registrations(keys::REGISTRATION_PREFIX).await
    }

    pub async fn read_registration(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> StorageResult<(RegistrationData, Vec<ResourceRecord>)> {
        if !self.lazy_open(false).await? {
            return Err(StorageError::NotFound);
        }

        let registration = self
            .read_registration_data(registration_id, origin)
            .await?
            .ok_or(StorageError::NotFound)?;
        let resources = self.read_resource_records(registration.version_id).await?;
        Ok((registration, resources))
    }

    /// Store `registration` with `resources` as its version's resource list.
    ///
    /// Resources of a replaced record that are not reused become purgeable,
    /// and the new resource ids leave the uncommitted and purgeable sets.
    pub async fn write_registration(
        &mut self,
        registration: &RegistrationData,
        resources: &[ResourceRecord],
    ) -> StorageResult<()> {
        let origin = origin_of(&registration.scope).ok_or_else(|| {
            StorageError::InvalidData(format!("scope {} has an opaque origin", registration.scope))
        })?;
        self.lazy_open(true).await?;

        let mut batch = WriteBatch::new();
        batch.put(keys::unique_origin_key(&origin), self.encode(&origin)?);

        self.bump_next_registration_id_if_needed(registration.registration_id, &mut batch)?;
        self.bump_next_version_id_if_needed(registration.version_id, &mut batch)?;

        let new_ids: BTreeSet<ResourceId> = resources.iter().map(|r| r.resource_id).collect();

        if let Some(old) = self
            .read_registration_data(registration.registration_id, &origin)
            .await?
        {
            for resource in self.read_resource_records(old.version_id).await? {
                batch.delete(keys::resource_key(old.version_id, resource.resource_id));
                if !new_ids.contains(&resource.resource_id) {
                    batch.put(
                        keys::resource_id_key(PURGEABLE_RESOURCE_PREFIX, resource.resource_id),
                        "",
                    );
                }
            }
        }

        batch.put(
            keys::registration_key(&origin, registration.registration_id),
            self.encode(registration)?,
        );

        for resource in resources {
            batch.put(
                keys::resource_key(registration.version_id, resource.resource_id),
                self.encode(resource)?,
            );
            batch.delete(keys::resource_id_key(
                UNCOMMITTED_RESOURCE_PREFIX,
                resource.resource_id,
            ));
            batch.delete(keys::resource_id_key(
                PURGEABLE_RESOURCE_PREFIX,
                resource.resource_id,
            ));
            self.bump_next_resource_id_if_needed(resource.resource_id, &mut batch)?;
        }

        self.write_batch(batch).await?;
        debug!(
            "Stored registration {} for {} (version {}, {} resources)",
            registration.registration_id,
            registration.scope,
            registration.version_id,
            resources.len()
        );
        Ok(())
    }

    pub async fn update_version_to_active(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> StorageResult<()> {
        self.update_registration(registration_id, origin, |registration| {
            registration.is_active = true;
        })
        .await
    }

    pub async fn update_last_check_time(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
        time: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update_registration(registration_id, origin, |registration| {
            registration.last_update_check = time;
        })
        .await
    }

    /// Remove a registration and mark its resources purgeable. Deleting a
    /// registration that does not exist succeeds.
    pub async fn delete_registration(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> StorageResult<()> {
        if !self.lazy_open(false).await? {
            return Ok(());
        }

        let registrations = self.get_registrations_for_origin(origin).await?;
        let mut batch = WriteBatch::new();

        // The origin leaves the index only with its last registration
        if registrations.len() == 1 && registrations[0].registration_id == registration_id {
            batch.delete(keys::unique_origin_key(origin));
        }

        batch.delete(keys::registration_key(origin, registration_id));

        if let Some(registration) = registrations
            .iter()
            .find(|r| r.registration_id == registration_id)
        {
            self.delete_resource_records(registration.version_id, &mut batch)
                .await?;
        }

        self.write_batch(batch).await
    }

    /// Remove every registration for `origin`. Returns the removed ids.
    pub async fn delete_all_data_for_origin(
        &mut self,
        origin: &str,
    ) -> StorageResult<Vec<RegistrationId>> {
        if !self.lazy_open(false).await? {
            return Ok(Vec::new());
        }

        let registrations = self.get_registrations_for_origin(origin).await?;
        let mut batch = WriteBatch::new();
        batch.delete(keys::unique_origin_key(origin));

        for registration in &registrations {
            batch.delete(keys::registration_key(origin, registration.registration_id));
            self.delete_resource_records(registration.version_id, &mut batch)
                .await?;
        }

        self.write_batch(batch).await?;
        info!(
            "Deleted {} registrations for origin {}",
            registrations.len(),
            origin
        );
        Ok(registrations.iter().map(|r| r.registration_id).collect())
    }

    pub async fn get_uncommitted_resource_ids(&mut self) -> StorageResult<BTreeSet<ResourceId>> {
        self.read_resource_ids(UNCOMMITTED_RESOURCE_PREFIX).await
    }

    pub async fn write_uncommitted_resource_ids(
        &mut self,
        ids: &BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.write_resource_ids(UNCOMMITTED_RESOURCE_PREFIX, ids).await
    }

    pub async fn clear_uncommitted_resource_ids(
        &mut self,
        ids: &BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.delete_resource_ids(UNCOMMITTED_RESOURCE_PREFIX, ids)
            .await
    }

    pub async fn get_purgeable_resource_ids(&mut self) -> StorageResult<BTreeSet<ResourceId>> {
        self.read_resource_ids(PURGEABLE_RESOURCE_PREFIX).await
    }

    pub async fn write_purgeable_resource_ids(
        &mut self,
        ids: &BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.write_resource_ids(PURGEABLE_RESOURCE_PREFIX, ids).await
    }

    pub async fn clear_purgeable_resource_ids(
        &mut self,
        ids: &BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.delete_resource_ids(PURGEABLE_RESOURCE_PREFIX, ids).await
    }

    /// Move every uncommitted resource id to the purgeable set in one batch
    pub async fn purge_uncommitted_resource_ids(
        &mut self,
    ) -> StorageResult<BTreeSet<ResourceId>> {
        let ids = self.get_uncommitted_resource_ids().await?;
        if ids.is_empty() {
            return Ok(ids);
        }

        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.delete(keys::resource_id_key(UNCOMMITTED_RESOURCE_PREFIX, *id));
            batch.put(keys::resource_id_key(PURGEABLE_RESOURCE_PREFIX, *id), "");
            self.bump_next_resource_id_if_needed(*id, &mut batch)?;
        }
        self.write_batch(batch).await?;
        Ok(ids)
    }

    async fn update_registration(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
        update: impl FnOnce(&mut RegistrationData),
    ) -> StorageResult<()> {
        if !self.lazy_open(false).await? {
            return Err(StorageError::NotFound);
        }

        let mut registration = self
            .read_registration_data(registration_id, origin)
            .await?
            .ok_or(StorageError::NotFound)?;
        update(&mut registration);

        let mut batch = WriteBatch::new();
        batch.put(
            keys::registration_key(origin, registration_id),
            self.encode(&registration)?,
        );
        self.write_batch(batch).await
    }

    async fn read_registration_data(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> StorageResult<Option<RegistrationData>> {
        let key = keys::registration_key(origin, registration_id);
        match self.get(&key).await? {
            Some(value) => self.decode(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    async fn read_registrations(&mut self, prefix: &str) -> StorageResult<Vec<RegistrationData>> {
        let entries = self.scan(prefix).await?;
        let mut registrations = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            registrations.push(self.decode(&key, &value)?);
        }
        Ok(registrations)
    }

    async fn read_resource_records(
        &mut self,
        version_id: VersionId,
    ) -> StorageResult<Vec<ResourceRecord>> {
        let entries = self.scan(&keys::resource_key_prefix(version_id)).await?;
        let mut resources = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            resources.push(self.decode(&key, &value)?);
        }
        Ok(resources)
    }

    async fn delete_resource_records(
        &mut self,
        version_id: VersionId,
        batch: &mut WriteBatch,
    ) -> StorageResult<()> {
        for resource in self.read_resource_records(version_id).await? {
            batch.delete(keys::resource_key(version_id, resource.resource_id));
            batch.put(
                keys::resource_id_key(PURGEABLE_RESOURCE_PREFIX, resource.resource_id),
                "",
            );
        }
        Ok(())
    }

    async fn read_resource_ids(&mut self, prefix: &str) -> StorageResult<BTreeSet<ResourceId>> {
        if !self.lazy_open(false).await? {
            return Ok(BTreeSet::new());
        }

        let entries = self.scan(prefix).await?;
        let mut ids = BTreeSet::new();
        for (key, _) in entries {
            let id = keys::parse_id(&key, prefix)
                .ok_or_else(|| StorageError::Corrupted(format!("malformed resource key {}", key)));
            ids.insert(self.check(id)?);
        }
        Ok(ids)
    }

    async fn write_resource_ids(
        &mut self,
        prefix: &str,
        ids: &BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.lazy_open(true).await?;

        let mut batch = WriteBatch::new();
        for id in ids {
            batch.put(keys::resource_id_key(prefix, *id), "");
            self.bump_next_resource_id_if_needed(*id, &mut batch)?;
        }
        self.write_batch(batch).await
    }

    async fn delete_resource_ids(
        &mut self,
        prefix: &str,
        ids: &BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        if ids.is_empty() || !self.lazy_open(false).await? {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for id in ids {
            batch.delete(keys::resource_id_key(prefix, *id));
        }
        self.write_batch(batch).await
    }

    async fn load_next_available_ids(&mut self) -> StorageResult<()> {
        self.next_ids = NextAvailableIds {
            registration_id: self.read_counter(keys::NEXT_REGISTRATION_ID_KEY).await?,
            version_id: self.read_counter(keys::NEXT_VERSION_ID_KEY).await?,
            resource_id: self.read_counter(keys::NEXT_RESOURCE_ID_KEY).await?,
        };
        debug!("Loaded next available ids: {:?}", self.next_ids);
        Ok(())
    }

    async fn read_counter(&mut self, key: &str) -> StorageResult<u64> {
        match self.get(key).await? {
            Some(value) => self.decode(key, &value),
            None => Ok(1),
        }
    }

    async fn read_database_version(&mut self) -> StorageResult<i64> {
        match self.get(keys::DATABASE_VERSION_KEY).await? {
            Some(value) => self.decode(keys::DATABASE_VERSION_KEY, &value),
            None => Ok(0),
        }
    }

    fn bump_next_registration_id_if_needed(
        &mut self,
        used_id: RegistrationId,
        batch: &mut WriteBatch,
    ) -> StorageResult<()> {
        if used_id >= self.next_ids.registration_id {
            self.next_ids.registration_id = used_id + 1;
            batch.put(
                keys::NEXT_REGISTRATION_ID_KEY,
                self.encode(&self.next_ids.registration_id)?,
            );
        }
        Ok(())
    }

    fn bump_next_version_id_if_needed(
        &mut self,
        used_id: VersionId,
        batch: &mut WriteBatch,
    ) -> StorageResult<()> {
        if used_id >= self.next_ids.version_id {
            self.next_ids.version_id = used_id + 1;
            batch.put(
                keys::NEXT_VERSION_ID_KEY,
                self.encode(&self.next_ids.version_id)?,
            );
        }
        Ok(())
    }

    fn bump_next_resource_id_if_needed(
        &mut self,
        used_id: ResourceId,
        batch: &mut WriteBatch,
    ) -> StorageResult<()> {
        if used_id >= self.next_ids.resource_id {
            self.next_ids.resource_id = used_id + 1;
            batch.put(
                keys::NEXT_RESOURCE_ID_KEY,
                self.encode(&self.next_ids.resource_id)?,
            );
        }
        Ok(())
    }

    async fn write_batch(&mut self, mut batch: WriteBatch) -> StorageResult<()> {
        if !self.is_initialized {
            let version = self.read_database_version().await?;
            if version > CURRENT_SCHEMA_VERSION {
                return Err(self.fail(StorageError::Corrupted(format!(
                    "unsupported schema version {}",
                    version
                ))));
            }
            if version == 0 {
                batch.put(keys::DATABASE_VERSION_KEY, CURRENT_SCHEMA_VERSION.to_string());
            }
        }

        let result = match self.store.as_ref() {
            Some(store) => store.write(batch).await,
            None => Err(StorageError::Disabled),
        };
        self.check(result)?;
        self.is_initialized = true;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> StorageResult<Option<String>> {
        let result = match self.store.as_ref() {
            Some(store) => store.get(key).await,
            None => Err(StorageError::Disabled),
        };
        self.check(result)
    }

    async fn scan(&mut self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        let result = match self.store.as_ref() {
            Some(store) => store.scan_prefix(prefix).await,
            None => Err(StorageError::Disabled),
        };
        self.check(result)
    }

    fn encode<T: Serialize>(&self, value: &T) -> StorageResult<String> {
        serde_json::to_string(value).map_err(|e| StorageError::InvalidData(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&mut self, key: &str, value: &str) -> StorageResult<T> {
        let decoded = serde_json::from_str(value)
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", key, e)));
        self.check(decoded)
    }

    fn check<T>(&mut self, result: StorageResult<T>) -> StorageResult<T> {
        result.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, error: StorageError) -> StorageError {
        if error.disables_store() {
            if matches!(error, StorageError::Corrupted(_)) {
                self.was_corruption_detected = true;
            }
            if !self.is_disabled {
                error!("Disabling registration database: {}", error);
            }
            self.is_disabled = true;
        }
        error
    }
}
