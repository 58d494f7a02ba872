//! Register job: find or create a registration, then install and activate
//! a new version of its script

use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use url::Url;
use warden_ipc::ProcessId;
use warden_storage::{RegistrationId, ResourceId, ResourceRecord, VersionId};

use super::{find_registration_for_pattern, JobContext};
use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::registration::RegistrationInfo;

/// How far an update got, for cleaning up after a failure
#[derive(Debug, Default)]
struct UpdateProgress {
    script_resource_id: Option<ResourceId>,
    stored: bool,
}

pub(crate) struct RegisterJob {
    context: JobContext,
    script_url: Url,
}

impl RegisterJob {
    pub(crate) fn new(context: JobContext, script_url: Url) -> Self {
        Self {
            context,
            script_url,
        }
    }

    pub(crate) async fn run(self) {
        debug!(
            "Register job {} started for {} ({})",
            self.context.job_id, self.context.pattern, self.script_url
        );
        let result = self.register().await.map(Some);
        self.context.complete(result);
    }

    async fn register(&self) -> ServiceWorkerResult<RegistrationInfo> {
        let existing = find_registration_for_pattern(
            &self.context.core,
            &self.context.store,
            &self.context.pattern,
        )
        .await;

        let registration_id = match existing {
            Ok(existing) if existing.script_url == self.script_url => {
                if existing.active_version.is_some() {
                    debug!(
                        "{} is already registered as {}",
                        self.context.pattern, existing.registration_id
                    );
                    return Ok(existing);
                }
                existing.registration_id
            }
            Ok(existing) => {
                info!(
                    "Script for {} changed from {} to {}; replacing registration {}",
                    self.context.pattern,
                    existing.script_url,
                    self.script_url,
                    existing.registration_id
                );
                self.context
                    .delete_registration(existing.registration_id)
                    .await?;
                self.create_registration().await?
            }
            Err(ServiceWorkerError::NotFound) => self.create_registration().await?,
            Err(e) => return Err(e),
        };

        self.update(registration_id).await
    }

    async fn create_registration(&self) -> ServiceWorkerResult<RegistrationId> {
        let pattern = self.context.pattern.clone();
        let script_url = self.script_url.clone();
        self.context
            .core
            .call(move |core| core.create_registration(pattern, script_url))
            .await?
    }

    async fn update(&self, registration_id: RegistrationId) -> ServiceWorkerResult<RegistrationInfo> {
        let pattern = self.context.pattern.clone();
        let job_id = self.context.job_id;
        let (version_id, lent_process_ids) = self
            .context
            .core
            .call(move |core| core.create_installing_version(&pattern, job_id, registration_id))
            .await??;

        let mut progress = UpdateProgress::default();
        match self
            .install_and_activate(registration_id, version_id, lent_process_ids, &mut progress)
            .await
        {
            Ok(info) => {
                info!(
                    "Registration {} for {} is active with version {}",
                    registration_id, self.context.pattern, version_id
                );
                Ok(info)
            }
            Err(e) => {
                warn!(
                    "Installing version {} for {} failed: {} ({})",
                    version_id,
                    self.context.pattern,
                    e,
                    e.error_code()
                );
                self.abandon(registration_id, version_id, &progress).await;
                Err(e)
            }
        }
    }

    async fn install_and_activate(
        &self,
        registration_id: RegistrationId,
        version_id: VersionId,
        candidate_process_ids: Vec<ProcessId>,
        progress: &mut UpdateProgress,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        let core = &self.context.core;
        let store = &self.context.store;
        let origin = self.context.origin()?;

        core.call_with_callback(move |core, done| {
            core.start_worker(version_id, candidate_process_ids, done)
        })
        .await?;

        let resource_id = core.call(|core| core.allocate_resource_id()).await?;
        store
            .write_uncommitted_resource_ids(BTreeSet::from([resource_id]))
            .await?;
        progress.script_resource_id = Some(resource_id);

        core.call_with_callback(move |core, done| core.dispatch_install_event(version_id, done))
            .await?;

        let data = core
            .call(move |core| core.registration_data_for_store(registration_id, version_id))
            .await??;
        let script = ResourceRecord {
            resource_id,
            url: self.script_url.clone(),
        };
        store.write_registration(data, vec![script]).await?;
        progress.stored = true;
        core.call(move |core| core.promote_to_waiting(registration_id, version_id))
            .await??;

        core.call_with_callback(move |core, done| core.dispatch_activate_event(version_id, done))
            .await?;
        core.call(move |core| core.activate_waiting_version(registration_id, version_id))
            .await??;
        store
            .update_version_to_active(registration_id, origin)
            .await?;

        core.call(move |core| core.registration_info(registration_id))
            .await?
    }

    /// Undo a failed update: give up the version, release its script
    /// resource and drop the registration if nothing is active
    async fn abandon(
        &self,
        registration_id: RegistrationId,
        version_id: VersionId,
        progress: &UpdateProgress,
    ) {
        let store = &self.context.store;
        if let (Some(resource_id), false) = (progress.script_resource_id, progress.stored) {
            let ids = BTreeSet::from([resource_id]);
            let moved = match store.clear_uncommitted_resource_ids(ids.clone()).await {
                Ok(()) => store.write_purgeable_resource_ids(ids).await,
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                warn!("Failed to release resource {}: {}", resource_id, e);
            }
        }

        let orphaned = self
            .context
            .core
            .call(move |core| core.abandon_version(registration_id, version_id))
            .await
            .unwrap_or(false);
        if orphaned {
            if let Err(e) = self.context.delete_registration(registration_id).await {
                warn!(
                    "Failed to delete registration {} after a failed install: {}",
                    registration_id, e
                );
            }
        }
    }
}
