//! The service worker context: entry point for clients and the execution host
//!
//! Starting a context spawns three tasks: the registration store sequence,
//! the control domain owning the `ProcessManager`, and the core domain
//! owning every live registration, version and embedded worker. The
//! context itself is a cheap cloneable handle that posts to them.

mod core_domain;
mod host_sink;

pub use core_domain::ContextCore;
pub use host_sink::HostEventSink;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use url::Url;
use warden_config::{StorageConfig, WardenConfig};
use warden_ipc::{ExecutionHost, FetchRequest, ProcessId};
use warden_process::{ControlDomain, ProcessManagerHandle, ProcessProvider};
use warden_storage::{
    origin_of, NextAvailableIds, RegistrationData, RegistrationStore, StorageLocation, VersionId,
};

use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::events::ContextEvent;
use crate::job::find_registration_for_pattern;
use crate::mailbox::{CoreMessage, CoreSender};
use crate::registration::RegistrationInfo;
use crate::utils::{same_origin, scope_matches};
use crate::version::{FetchOutcome, VersionInfo};

/// Resolve the configured storage to a store location
pub fn storage_location(config: &StorageConfig) -> StorageLocation {
    match &config.path {
        Some(directory) if !config.is_in_memory() => StorageLocation::OnDisk {
            directory: directory.clone(),
            file_name: config.file_name.clone(),
        },
        _ => StorageLocation::InMemory,
    }
}

/// Client-facing handle to the registration and lifecycle subsystem
#[derive(Clone)]
pub struct ServiceWorkerContext {
    core: CoreSender,
    store: RegistrationStore,
    process_manager: ProcessManagerHandle,
}

impl ServiceWorkerContext {
    /// Validate `config` and start a context on its storage settings
    pub async fn start(
        config: &WardenConfig,
        provider: Box<dyn ProcessProvider>,
        host: Arc<dyn ExecutionHost>,
    ) -> ServiceWorkerResult<Self> {
        config
            .validate_all()
            .map_err(|e| ServiceWorkerError::Failed(e.to_string()))?;
        Ok(Self::start_with_location(storage_location(&config.storage), provider, host).await)
    }

    /// Start a context on an explicit store location.
    ///
    /// Reads the next available ids and moves every uncommitted resource id
    /// left over from a previous run to the purgeable set. A store that
    /// cannot be read leaves the context running with a disabled store.
    pub async fn start_with_location(
        location: StorageLocation,
        provider: Box<dyn ProcessProvider>,
        host: Arc<dyn ExecutionHost>,
    ) -> Self {
        let store = RegistrationStore::open(location);

        let next_ids = match store.get_next_available_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to read next available ids: {}", e);
                NextAvailableIds::default()
            }
        };
        match store.purge_uncommitted_resource_ids().await {
            Ok(ids) if !ids.is_empty() => {
                info!("Marked {} uncommitted resources purgeable", ids.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to purge uncommitted resources: {}", e),
        }

        let process_manager = ControlDomain::spawn(provider);
        let (core, receiver) = CoreSender::channel();
        let state = ContextCore::new(
            store.clone(),
            process_manager.clone(),
            host,
            core.clone(),
            next_ids,
        );
        tokio::spawn(state.run(receiver));

        info!(
            "Service worker context started (next registration {}, version {}, resource {})",
            next_ids.registration_id, next_ids.version_id, next_ids.resource_id
        );
        Self {
            core,
            store,
            process_manager,
        }
    }

    /// Handle through which the execution host reports worker events
    pub fn host_event_sink(&self) -> HostEventSink {
        HostEventSink::new(self.core.clone())
    }

    pub fn store(&self) -> &RegistrationStore {
        &self.store
    }

    pub async fn subscribe(&self) -> ServiceWorkerResult<mpsc::UnboundedReceiver<ContextEvent>> {
        self.core.call(|core| core.subscribe()).await
    }

    /// Register `script_url` for `pattern` and wait for it to activate.
    ///
    /// Concurrent registrations of the same pattern and script share one
    /// job. `source_process_id` is tried first when the worker starts.
    pub async fn register(
        &self,
        pattern: Url,
        script_url: Url,
        source_process_id: Option<ProcessId>,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        if !same_origin(&pattern, &script_url) {
            return Err(ServiceWorkerError::Security(format!(
                "{} and {} are not same-origin",
                pattern, script_url
            )));
        }

        let registration = self
            .core
            .call_with_callback(move |core, done| {
                core.schedule_register(pattern, script_url, source_process_id, done)
            })
            .await?;
        registration.ok_or_else(|| {
            ServiceWorkerError::Failed("register job finished without a registration".to_string())
        })
    }

    /// Callback form of `register`
    pub fn register_with_callback(
        &self,
        pattern: Url,
        script_url: Url,
        source_process_id: Option<ProcessId>,
        callback: impl FnOnce(ServiceWorkerResult<RegistrationInfo>) + Send + 'static,
    ) {
        let context = self.clone();
        tokio::spawn(async move {
            callback(
                context
                    .register(pattern, script_url, source_process_id)
                    .await,
            )
        });
    }

    /// Remove the registration for `pattern`. Succeeds when there is none.
    pub async fn unregister(&self, pattern: Url) -> ServiceWorkerResult<()> {
        self.core
            .call_with_callback(move |core, done| core.schedule_unregister(pattern, done))
            .await
            .map(|_| ())
    }

    /// Callback form of `unregister`
    pub fn unregister_with_callback(
        &self,
        pattern: Url,
        callback: impl FnOnce(ServiceWorkerResult<()>) + Send + 'static,
    ) {
        let context = self.clone();
        tokio::spawn(async move { callback(context.unregister(pattern).await) });
    }

    /// Registration for exactly `pattern`, loading it from the store if needed
    pub async fn find_registration(&self, pattern: &Url) -> ServiceWorkerResult<RegistrationInfo> {
        find_registration_for_pattern(&self.core, &self.store, pattern).await
    }

    /// Registration with the longest pattern that matches `document_url`
    pub async fn find_registration_for_document(
        &self,
        document_url: &Url,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        let lookup = document_url.clone();
        let live = self
            .core
            .call(move |core| core.live_registration_for_document(&lookup))
            .await?;

        let origin = origin_of(document_url).ok_or(ServiceWorkerError::NotFound)?;
        let stored = match self.store.get_registrations_for_origin(origin).await {
            Ok(stored) => stored,
            Err(e) if live.is_some() => {
                warn!("Using live registrations only: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        let stored = stored
            .into_iter()
            .filter(|data| scope_matches(&data.scope, document_url))
            .max_by_key(|data| data.scope.as_str().len());

        match (live, stored) {
            (Some(live), Some(stored))
                if stored.scope.as_str().len() > live.pattern.as_str().len() =>
            {
                self.adopt(stored).await
            }
            (Some(live), _) => Ok(live),
            (None, Some(stored)) => self.adopt(stored).await,
            (None, None) => Err(ServiceWorkerError::NotFound),
        }
    }

    /// Every stored registration
    pub async fn get_all_registrations(&self) -> ServiceWorkerResult<Vec<RegistrationData>> {
        Ok(self.store.get_all_registrations().await?)
    }

    /// Delete every registration for `origin`, stored and live.
    ///
    /// Jobs running for the origin are aborted and waited for before the
    /// store is touched, and no new job for it starts until the live
    /// registrations are gone as well.
    pub async fn delete_all_data_for_origin(&self, origin: &str) -> ServiceWorkerResult<()> {
        let held = origin.to_string();
        let aborted = self.core.call(move |core| core.hold_origin(&held)).await?;
        for task in aborted {
            let _ = task.await;
        }

        let deleted = self
            .store
            .delete_all_data_for_origin(origin.to_string())
            .await;
        let removed = deleted.is_ok();
        let held = origin.to_string();
        let live = self
            .core
            .call(move |core| {
                let live = if removed {
                    core.remove_registrations_for_origin(&held)
                } else {
                    Vec::new()
                };
                core.release_origin(&held);
                live
            })
            .await?;

        let deleted = deleted?;
        info!(
            "Deleted {} stored and {} live registrations for {}",
            deleted.len(),
            live.len(),
            origin
        );
        Ok(())
    }

    /// Route a fetch for `document_url` to the active version controlling it
    pub async fn dispatch_fetch_event(
        &self,
        document_url: &Url,
        request: FetchRequest,
    ) -> ServiceWorkerResult<FetchOutcome> {
        let registration_id = self
            .find_registration_for_document(document_url)
            .await?
            .registration_id;
        self.core
            .call_with_callback(move |core, done| {
                core.dispatch_fetch_event(registration_id, request, done)
            })
            .await
    }

    /// Fire a sync event at the active version registered for `pattern`
    pub async fn dispatch_sync_event(&self, pattern: &Url) -> ServiceWorkerResult<()> {
        let registration_id = self.find_registration(pattern).await?.registration_id;
        self.core
            .call_with_callback(move |core, done| core.dispatch_sync_event(registration_id, done))
            .await
    }

    /// Stop the worker running `version_id`
    pub async fn stop_worker(&self, version_id: VersionId) -> ServiceWorkerResult<()> {
        self.core
            .call_with_callback(move |core, done| core.stop_worker(version_id, done))
            .await
    }

    pub async fn version_info(&self, version_id: VersionId) -> ServiceWorkerResult<VersionInfo> {
        self.core
            .call(move |core| core.version_info(version_id))
            .await?
            .ok_or(ServiceWorkerError::NotFound)
    }

    /// Make every process allocation return `process_id`
    pub fn set_process_id_for_test(&self, process_id: ProcessId) {
        self.process_manager.set_process_id_for_test(process_id);
    }

    /// Abort every job, shut all registrations down, release every process
    /// reference and close the store. Later calls fail with `Abort`.
    pub async fn shutdown(&self) {
        info!("Shutting down service worker context");
        let (reply, done) = oneshot::channel();
        if self.core.send(CoreMessage::Shutdown(reply)) {
            let _ = done.await;
        }
        self.process_manager.shutdown().await;
        self.store.close().await;
    }

    async fn adopt(&self, data: RegistrationData) -> ServiceWorkerResult<RegistrationInfo> {
        self.core
            .call(move |core| core.adopt_stored_registration(data))
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PeerBehavior, TestHarness};
    use crate::version::VersionStatus;
    use crate::EmbeddedWorkerStatus;
    use std::collections::BTreeSet;
    use warden_ipc::{EventResult, FetchEventResult};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn pattern() -> Url {
        url("https://example.com/app/*")
    }

    fn script() -> Url {
        url("https://example.com/app/sw.js")
    }

    fn status_changes(
        events: &mut mpsc::UnboundedReceiver<ContextEvent>,
        version_id: VersionId,
    ) -> Vec<VersionStatus> {
        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ContextEvent::VersionStatusChanged {
                version_id: id,
                status,
                ..
            } = event
            {
                if id == version_id {
                    statuses.push(status);
                }
            }
        }
        statuses
    }

    #[test]
    fn test_storage_location_from_config() {
        assert_eq!(
            storage_location(&StorageConfig::default()),
            StorageLocation::InMemory
        );

        let mut config = StorageConfig::on_disk("/var/lib/warden");
        assert_eq!(
            storage_location(&config),
            StorageLocation::OnDisk {
                directory: std::path::PathBuf::from("/var/lib/warden"),
                file_name: config.file_name.clone(),
            }
        );

        config.in_memory = true;
        assert_eq!(storage_location(&config), StorageLocation::InMemory);
    }

    #[tokio::test]
    async fn test_register_installs_and_activates() {
        let harness = TestHarness::start().await;
        let mut events = harness.context.subscribe().await.unwrap();

        let info = harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();

        assert_eq!(info.registration_id, 1);
        assert_eq!(info.pattern, pattern());
        let active = info.active_version.as_ref().unwrap();
        assert_eq!(active.version_id, 1);
        assert_eq!(active.status, VersionStatus::Active);
        assert_eq!(active.running_status, EmbeddedWorkerStatus::Running);
        assert!(active.has_fetch_handler);
        assert!(info.installing_version.is_none());
        assert!(info.waiting_version.is_none());

        assert_eq!(
            status_changes(&mut events, 1),
            vec![
                VersionStatus::Installing,
                VersionStatus::Installed,
                VersionStatus::Activating,
                VersionStatus::Active,
            ]
        );

        let stored = harness.context.get_all_registrations().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_active);
        assert_eq!(stored[0].version_id, 1);
        assert!(harness
            .context
            .store()
            .get_uncommitted_resource_ids()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(harness.provider.live_references(), 1);
    }

    #[tokio::test]
    async fn test_register_same_script_returns_existing() {
        let harness = TestHarness::start().await;
        let first = harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        let second = harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();

        assert_eq!(first.registration_id, second.registration_id);
        assert_eq!(second.active_version_id(), Some(1));
        assert_eq!(harness.peer.start_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_share_one_job() {
        let harness = TestHarness::start().await;
        let context = &harness.context;

        let results =
            futures::future::join_all((0..3).map(|_| context.register(pattern(), script(), None)))
                .await;

        let ids: BTreeSet<_> = results
            .into_iter()
            .map(|result| result.unwrap().registration_id)
            .collect();
        assert_eq!(ids, BTreeSet::from([1]));
        assert_eq!(harness.peer.start_count(), 1);
    }

    #[tokio::test]
    async fn test_new_script_replaces_registration() {
        let harness = TestHarness::start().await;
        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();

        let replaced = harness
            .context
            .register(pattern(), url("https://example.com/app/sw2.js"), None)
            .await
            .unwrap();
        assert_eq!(replaced.registration_id, 2);
        assert_eq!(replaced.active_version_id(), Some(2));

        let stored = harness.context.get_all_registrations().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].registration_id, 2);
        assert_eq!(
            harness
                .context
                .store()
                .get_purgeable_resource_ids()
                .await
                .unwrap(),
            BTreeSet::from([1])
        );
    }

    #[tokio::test]
    async fn test_rejected_install_leaves_nothing_behind() {
        let behavior = PeerBehavior {
            install_result: EventResult::Rejected,
            ..Default::default()
        };
        let harness = TestHarness::start_with(StorageLocation::InMemory, behavior).await;

        let result = harness.context.register(pattern(), script(), None).await;
        assert_eq!(result, Err(ServiceWorkerError::InstallWorkerFailed));

        assert_eq!(
            harness.context.find_registration(&pattern()).await,
            Err(ServiceWorkerError::NotFound)
        );
        let store = harness.context.store();
        assert!(store.get_all_registrations().await.unwrap().is_empty());
        assert!(store.get_uncommitted_resource_ids().await.unwrap().is_empty());
        assert_eq!(
            store.get_purgeable_resource_ids().await.unwrap(),
            BTreeSet::from([1])
        );
    }

    #[tokio::test]
    async fn test_process_creation_failure_fails_register() {
        let harness = TestHarness::start().await;
        harness.provider.set_fail_creation(true);

        let result = harness.context.register(pattern(), script(), None).await;
        assert!(matches!(result, Err(ServiceWorkerError::StartWorkerFailed(_))));
        assert_eq!(harness.peer.start_count(), 0);

        harness.provider.set_fail_creation(false);
        let info = harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        assert_eq!(info.active_version_id(), Some(2));
    }

    #[tokio::test]
    async fn test_worker_that_dies_on_start_fails_register() {
        let behavior = PeerBehavior {
            fail_start: true,
            ..Default::default()
        };
        let harness = TestHarness::start_with(StorageLocation::InMemory, behavior).await;

        let result = harness.context.register(pattern(), script(), None).await;
        assert!(matches!(result, Err(ServiceWorkerError::StartWorkerFailed(_))));
        assert_eq!(harness.peer.start_count(), 1);
        assert_eq!(
            harness.context.find_registration(&pattern()).await,
            Err(ServiceWorkerError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_register_rejects_cross_origin_script() {
        let harness = TestHarness::start().await;
        let result = harness
            .context
            .register(pattern(), url("https://cdn.example.net/sw.js"), None)
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::Security(_))));
    }

    #[tokio::test]
    async fn test_register_with_callback() {
        let harness = TestHarness::start().await;
        let (done, result) = tokio::sync::oneshot::channel();
        harness
            .context
            .register_with_callback(pattern(), script(), None, move |result| {
                let _ = done.send(result);
            });

        let info = result.await.unwrap().unwrap();
        assert_eq!(info.active_version_id(), Some(1));
    }

    #[tokio::test]
    async fn test_fetch_goes_to_active_version() {
        let harness = TestHarness::start().await;
        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();

        let document = url("https://example.com/app/index.html");
        let outcome = harness
            .context
            .dispatch_fetch_event(&document, FetchRequest::get(document.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.result, FetchEventResult::Response);
        assert_eq!(outcome.response.unwrap().status_code, 200);

        let outside = url("https://example.com/other/index.html");
        let result = harness
            .context
            .dispatch_fetch_event(&outside, FetchRequest::get(outside.clone()))
            .await;
        assert_eq!(result, Err(ServiceWorkerError::NotFound));
    }

    #[tokio::test]
    async fn test_sync_event() {
        let harness = TestHarness::start().await;
        assert_eq!(
            harness.context.dispatch_sync_event(&pattern()).await,
            Err(ServiceWorkerError::NotFound)
        );

        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        assert_eq!(harness.context.dispatch_sync_event(&pattern()).await, Ok(()));
    }

    #[tokio::test]
    async fn test_document_lookup_prefers_longest_pattern() {
        let harness = TestHarness::start().await;
        let root = url("https://example.com/*");
        harness
            .context
            .register(root.clone(), url("https://example.com/sw.js"), None)
            .await
            .unwrap();
        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();

        let found = harness
            .context
            .find_registration_for_document(&url("https://example.com/app/page"))
            .await
            .unwrap();
        assert_eq!(found.pattern, pattern());

        let found = harness
            .context
            .find_registration_for_document(&url("https://example.com/about"))
            .await
            .unwrap();
        assert_eq!(found.pattern, root);
    }

    #[tokio::test]
    async fn test_stop_worker_and_restart_on_demand() {
        let harness = TestHarness::start().await;
        let info = harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        let version_id = info.active_version_id().unwrap();

        harness.context.stop_worker(version_id).await.unwrap();
        let stopped = harness.context.version_info(version_id).await.unwrap();
        assert_eq!(stopped.running_status, EmbeddedWorkerStatus::Stopped);
        assert_eq!(stopped.process_id, None);

        // A fetch restarts the worker
        let document = url("https://example.com/app/");
        harness
            .context
            .dispatch_fetch_event(&document, FetchRequest::get(document.clone()))
            .await
            .unwrap();
        assert_eq!(harness.peer.start_count(), 2);
        let running = harness.context.version_info(version_id).await.unwrap();
        assert_eq!(running.running_status, EmbeddedWorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_unregister() {
        let harness = TestHarness::start().await;
        assert_eq!(harness.context.unregister(pattern()).await, Ok(()));

        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        harness.context.unregister(pattern()).await.unwrap();

        assert_eq!(
            harness.context.find_registration(&pattern()).await,
            Err(ServiceWorkerError::NotFound)
        );
        assert!(harness
            .context
            .get_all_registrations()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(harness.context.version_info(1).await, Err(ServiceWorkerError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_all_data_for_origin() {
        let harness = TestHarness::start().await;
        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();

        harness
            .context
            .delete_all_data_for_origin("https://example.com")
            .await
            .unwrap();
        assert!(harness
            .context
            .get_all_registrations()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            harness.context.find_registration(&pattern()).await,
            Err(ServiceWorkerError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_origin_wipe_aborts_register_that_already_stored() {
        let behavior = PeerBehavior {
            hold_activate: true,
            ..Default::default()
        };
        let harness = TestHarness::start_with(StorageLocation::InMemory, behavior).await;
        let mut events = harness.context.subscribe().await.unwrap();

        let context = harness.context.clone();
        let register =
            tokio::spawn(async move { context.register(pattern(), script(), None).await });

        // The job has written its record and now waits for activation
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, ContextEvent::RegistrationStored { .. }) {
                break;
            }
        }
        assert_eq!(
            harness.context.get_all_registrations().await.unwrap().len(),
            1
        );

        harness
            .context
            .delete_all_data_for_origin("https://example.com")
            .await
            .unwrap();
        assert_eq!(register.await.unwrap(), Err(ServiceWorkerError::Abort));
        assert!(harness
            .context
            .get_all_registrations()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            harness.context.find_registration(&pattern()).await,
            Err(ServiceWorkerError::NotFound)
        );

        // Jobs for the origin run again once the wipe is over
        harness.peer.set_behavior(PeerBehavior::default());
        let info = harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        assert_eq!(info.registration_id, 2);
        let stored = harness.context.get_all_registrations().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].registration_id, 2);
    }

    #[tokio::test]
    async fn test_register_during_origin_wipe_waits_for_it() {
        let harness = TestHarness::start().await;
        let core = &harness.context.core;
        let aborted = core
            .call(|core| core.hold_origin("https://example.com"))
            .await
            .unwrap();
        assert!(aborted.is_empty());

        let (done, result) = oneshot::channel();
        core.post(move |core| {
            core.schedule_register(
                pattern(),
                script(),
                None,
                Box::new(move |result| {
                    let _ = done.send(result);
                }),
            )
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let live = core
            .call(|core| core.live_registration_for_pattern(&pattern()))
            .await
            .unwrap();
        assert!(live.is_none());
        assert_eq!(harness.peer.start_count(), 0);

        core.call(|core| core.release_origin("https://example.com"))
            .await
            .unwrap();
        let info = result.await.unwrap().unwrap().unwrap();
        assert_eq!(info.active_version_id(), Some(1));
        assert_eq!(harness.peer.start_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_processes_and_aborts_later_calls() {
        let harness = TestHarness::start().await;
        harness
            .context
            .register(pattern(), script(), None)
            .await
            .unwrap();
        assert_eq!(harness.provider.live_references(), 1);

        harness.context.shutdown().await;
        assert_eq!(harness.provider.live_references(), 0);
        assert_eq!(
            harness.context.register(pattern(), script(), None).await,
            Err(ServiceWorkerError::Abort)
        );
    }
}
