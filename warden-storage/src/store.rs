//! Registration store running on its own task

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::database::RegistrationDatabase;
use crate::error::{StorageError, StorageResult};
use crate::records::{
    NextAvailableIds, RegistrationData, RegistrationId, ResourceId, ResourceRecord,
    StorageLocation,
};

type StoreTask = Box<dyn for<'a> FnOnce(&'a mut RegistrationDatabase) -> BoxFuture<'a, ()> + Send>;

fn store_task<F>(task: F) -> StoreTask
where
    F: for<'a> FnOnce(&'a mut RegistrationDatabase) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(task)
}

enum StoreMessage {
    Run(StoreTask),
    Close(oneshot::Sender<()>),
}

/// Cloneable handle to a `RegistrationDatabase` owned by a dedicated task.
///
/// Operations run one at a time in the order they were posted. Once the
/// task is gone every call fails with `StorageError::Disabled`.
#[derive(Clone)]
pub struct RegistrationStore {
    sender: mpsc::UnboundedSender<StoreMessage>,
}

impl RegistrationStore {
    /// Spawn the store task for `location`. Must be called inside a tokio runtime.
    pub fn open(location: StorageLocation) -> Self {
        Self::start(RegistrationDatabase::new(location))
    }

    /// Spawn the store task around an existing database
    pub fn start(mut database: RegistrationDatabase) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            debug!("Registration store task started");
            while let Some(message) = receiver.recv().await {
                match message {
                    StoreMessage::Run(task) => task(&mut database).await,
                    StoreMessage::Close(reply) => {
                        drop(database);
                        let _ = reply.send(());
                        debug!("Registration store closed");
                        return;
                    }
                }
            }
            debug!("Registration store task stopped");
        });
        Self { sender }
    }

    async fn run<T, F>(&self, operation: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut RegistrationDatabase) -> BoxFuture<'a, StorageResult<T>>
            + Send
            + 'static,
    {
        let (reply, response) = oneshot::channel();
        let task = store_task(move |database| {
            async move {
                let _ = reply.send(operation(database).await);
            }
            .boxed()
        });

        self.sender
            .send(StoreMessage::Run(task))
            .map_err(|_| StorageError::Disabled)?;
        response.await.map_err(|_| StorageError::Disabled)?
    }

    pub async fn get_next_available_ids(&self) -> StorageResult<NextAvailableIds> {
        self.run(|database| database.get_next_available_ids().boxed())
            .await
    }

    pub async fn get_origins_with_registrations(&self) -> StorageResult<BTreeSet<String>> {
        self.run(|database| database.get_origins_with_registrations().boxed())
            .await
    }

    pub async fn get_registrations_for_origin(
        &self,
        origin: String,
    ) -> StorageResult<Vec<RegistrationData>> {
        self.run(move |database| {
            async move { database.get_registrations_for_origin(&origin).await }.boxed()
        })
        .await
    }

    pub async fn get_all_registrations(&self) -> StorageResult<Vec<RegistrationData>> {
        self.run(|database| database.get_all_registrations().boxed())
            .await
    }

    pub async fn read_registration(
        &self,
        registration_id: RegistrationId,
        origin: String,
    ) -> StorageResult<(RegistrationData, Vec<ResourceRecord>)> {
        self.run(move |database| {
            async move { database.read_registration(registration_id, &origin).await }.boxed()
        })
        .await
    }

    pub async fn write_registration(
        &self,
        registration: RegistrationData,
        resources: Vec<ResourceRecord>,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move {
                database
                    .write_registration(&registration, &resources)
                    .await
            }
            .boxed()
        })
        .await
    }

    pub async fn update_version_to_active(
        &self,
        registration_id: RegistrationId,
        origin: String,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move {
                database
                    .update_version_to_active(registration_id, &origin)
                    .await
            }
            .boxed()
        })
        .await
    }

    pub async fn update_last_check_time(
        &self,
        registration_id: RegistrationId,
        origin: String,
        time: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move {
                database
                    .update_last_check_time(registration_id, &origin, time)
                    .await
            }
            .boxed()
        })
        .await
    }

    pub async fn delete_registration(
        &self,
        registration_id: RegistrationId,
        origin: String,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move { database.delete_registration(registration_id, &origin).await }.boxed()
        })
        .await
    }

    pub async fn delete_all_data_for_origin(
        &self,
        origin: String,
    ) -> StorageResult<Vec<RegistrationId>> {
        self.run(move |database| {
            async move { database.delete_all_data_for_origin(&origin).await }.boxed()
        })
        .await
    }

    pub async fn get_uncommitted_resource_ids(&self) -> StorageResult<BTreeSet<ResourceId>> {
        self.run(|database| database.get_uncommitted_resource_ids().boxed())
            .await
    }

    pub async fn write_uncommitted_resource_ids(
        &self,
        ids: BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move { database.write_uncommitted_resource_ids(&ids).await }.boxed()
        })
        .await
    }

    pub async fn clear_uncommitted_resource_ids(
        &self,
        ids: BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move { database.clear_uncommitted_resource_ids(&ids).await }.boxed()
        })
        .await
    }

    pub async fn get_purgeable_resource_ids(&self) -> StorageResult<BTreeSet<ResourceId>> {
        self.run(|database| database.get_purgeable_resource_ids().boxed())
            .await
    }

    pub async fn write_purgeable_resource_ids(
        &self,
        ids: BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move { database.write_purgeable_resource_ids(&ids).await }.boxed()
        })
        .await
    }

    pub async fn clear_purgeable_resource_ids(
        &self,
        ids: BTreeSet<ResourceId>,
    ) -> StorageResult<()> {
        self.run(move |database| {
            async move { database.clear_purgeable_resource_ids(&ids).await }.boxed()
        })
        .await
    }

    /// Move every uncommitted resource id to the purgeable set.
    ///
    /// Run once at startup: ids still uncommitted at that point were never
    /// bound to a registration before the previous shutdown.
    pub async fn purge_uncommitted_resource_ids(&self) -> StorageResult<BTreeSet<ResourceId>> {
        self.run(|database| database.purge_uncommitted_resource_ids().boxed())
            .await
    }

    /// Stop the store task after the operations already posted. Every
    /// handle fails with `StorageError::Disabled` afterwards.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.sender.send(StoreMessage::Close(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Whether the store has been disabled by an earlier failure
    pub async fn is_disabled(&self) -> bool {
        self.run(|database| {
            async move { Ok::<_, StorageError>(database.is_disabled()) }.boxed()
        })
        .await
        .unwrap_or(true)
    }

    /// Whether undecodable data has been seen
    pub async fn was_corruption_detected(&self) -> bool {
        self.run(|database| {
            async move { Ok::<_, StorageError>(database.was_corruption_detected()) }.boxed()
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn registration(registration_id: RegistrationId, scope: &str) -> RegistrationData {
        let scope = Url::parse(scope).unwrap();
        RegistrationData {
            registration_id,
            script: scope.join("worker.js").unwrap(),
            scope,
            version_id: registration_id,
            is_active: true,
            has_fetch_handler: false,
            last_update_check: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_operations_through_task() {
        let store = RegistrationStore::open(StorageLocation::InMemory);
        let data = registration(1, "https://example.com/app/");
        let resource = ResourceRecord {
            resource_id: 4,
            url: data.script.clone(),
        };

        store
            .write_registration(data.clone(), vec![resource.clone()])
            .await
            .unwrap();

        let (stored, resources) = store
            .read_registration(1, "https://example.com".to_string())
            .await
            .unwrap();
        assert_eq!(stored, data);
        assert_eq!(resources, vec![resource]);

        let next = store.get_next_available_ids().await.unwrap();
        assert_eq!(next.registration_id, 2);
        assert_eq!(next.resource_id, 5);
        assert!(!store.is_disabled().await);
    }

    #[tokio::test]
    async fn test_purge_uncommitted_resource_ids() {
        let store = RegistrationStore::open(StorageLocation::InMemory);
        let ids: BTreeSet<ResourceId> = [3, 5].into_iter().collect();
        store
            .write_uncommitted_resource_ids(ids.clone())
            .await
            .unwrap();
        store
            .write_purgeable_resource_ids([1].into_iter().collect())
            .await
            .unwrap();

        let moved = store.purge_uncommitted_resource_ids().await.unwrap();
        assert_eq!(moved, ids);
        assert!(store
            .get_uncommitted_resource_ids()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_purgeable_resource_ids().await.unwrap(),
            [1, 3, 5].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_clones_share_one_database() {
        let store = RegistrationStore::open(StorageLocation::InMemory);
        let other = store.clone();

        store
            .write_registration(registration(7, "https://example.com/a/"), Vec::new())
            .await
            .unwrap();
        let all = other.get_all_registrations().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].registration_id, 7);
    }

    #[tokio::test]
    async fn test_closed_store_is_disabled() {
        let store = RegistrationStore::open(StorageLocation::InMemory);
        store
            .write_purgeable_resource_ids([2].into_iter().collect())
            .await
            .unwrap();

        store.close().await;
        assert_eq!(
            store.get_purgeable_resource_ids().await,
            Err(StorageError::Disabled)
        );
        assert!(store.is_disabled().await);
    }
}
