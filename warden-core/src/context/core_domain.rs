//! Core domain: the task that owns every live registration, version and
//! embedded worker

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use warden_ipc::{EmbeddedWorkerId, ExecutionHost, FetchRequest, HostEvent, ProcessId};
use warden_process::{ProcessManagerHandle, ProcessResult};
use warden_storage::{
    origin_of, NextAvailableIds, RegistrationData, RegistrationId, RegistrationStore, ResourceId,
    VersionId,
};

use crate::embedded_worker::EmbeddedWorkerInstance;
use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::events::ContextEvent;
use crate::job::{
    JobContext, JobCoordinator, JobId, JobKind, RegisterJob, RegistrationCallback, Scheduled,
    UnregisterJob,
};
use crate::mailbox::{CoreMessage, CoreSender};
use crate::observer::ObserverList;
use crate::registration::{RegistrationInfo, ServiceWorkerRegistration};
use crate::utils::scope_matches;
use crate::version::{
    FetchCallback, ServiceWorkerVersion, StatusCallback, VersionInfo, VersionStatus,
};

/// State of the core domain. Only ever touched from its own task, through
/// `CoreSender::post` and friends.
pub struct ContextCore {
    registrations: BTreeMap<RegistrationId, ServiceWorkerRegistration>,
    jobs: JobCoordinator,
    observers: ObserverList<ContextEvent>,
    store: RegistrationStore,
    process_manager: ProcessManagerHandle,
    host: Arc<dyn ExecutionHost>,
    sender: CoreSender,
    next_registration_id: RegistrationId,
    next_version_id: VersionId,
    next_resource_id: ResourceId,
    next_embedded_worker_id: EmbeddedWorkerId,
}

impl ContextCore {
    pub(crate) fn new(
        store: RegistrationStore,
        process_manager: ProcessManagerHandle,
        host: Arc<dyn ExecutionHost>,
        sender: CoreSender,
        next_ids: NextAvailableIds,
    ) -> Self {
        Self {
            registrations: BTreeMap::new(),
            jobs: JobCoordinator::new(),
            observers: ObserverList::new(),
            store,
            process_manager,
            host,
            sender,
            next_registration_id: next_ids.registration_id,
            next_version_id: next_ids.version_id,
            next_resource_id: next_ids.resource_id,
            next_embedded_worker_id: 1,
        }
    }

    pub(crate) async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<CoreMessage>) {
        debug!("Core domain started");
        while let Some(message) = receiver.recv().await {
            match message {
                CoreMessage::Task(task) => task(&mut self),
                CoreMessage::ProcessAllocated {
                    embedded_worker_id,
                    result,
                } => self.on_process_allocated(embedded_worker_id, result),
                CoreMessage::Host {
                    process_id,
                    embedded_worker_id,
                    event,
                } => self.on_host_event(process_id, embedded_worker_id, event),
                CoreMessage::Notify(event) => self.observers.notify(event),
                CoreMessage::Shutdown(reply) => {
                    self.shutdown();
                    // Publish what the shutdown itself produced; drop the rest
                    while let Ok(message) = receiver.try_recv() {
                        if let CoreMessage::Notify(event) = message {
                            self.observers.notify(event);
                        }
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("Core domain stopped");
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ContextEvent> {
        self.observers.subscribe().1
    }

    pub fn version_info(&self, version_id: VersionId) -> Option<VersionInfo> {
        self.registrations
            .values()
            .flat_map(|registration| registration.versions())
            .find(|version| version.version_id() == version_id)
            .map(|version| version.info())
    }

    pub fn registration_info(
        &self,
        registration_id: RegistrationId,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        self.registrations
            .get(&registration_id)
            .map(|registration| registration.info())
            .ok_or(ServiceWorkerError::NotFound)
    }

    pub fn live_registration_for_pattern(&self, pattern: &Url) -> Option<RegistrationInfo> {
        self.registrations
            .values()
            .find(|registration| registration.pattern() == pattern)
            .map(|registration| registration.info())
    }

    /// Live registration with the longest pattern matching `document_url`
    pub fn live_registration_for_document(&self, document_url: &Url) -> Option<RegistrationInfo> {
        self.registrations
            .values()
            .filter(|registration| scope_matches(registration.pattern(), document_url))
            .max_by_key(|registration| registration.pattern().as_str().len())
            .map(|registration| registration.info())
    }

    pub fn live_registrations(&self) -> Vec<RegistrationInfo> {
        self.registrations
            .values()
            .map(|registration| registration.info())
            .collect()
    }

    /// Load a stored registration into the live set. An ACTIVE record's
    /// version goes to the active slot, anything else waits.
    pub fn adopt_stored_registration(
        &mut self,
        data: RegistrationData,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        if let Some(existing) = self.registrations.get(&data.registration_id) {
            return Ok(existing.info());
        }
        let origin = data.origin().ok_or_else(|| {
            ServiceWorkerError::StoreCorrupt(format!("{} has an opaque origin", data.scope))
        })?;

        debug!(
            "Adopting stored registration {} for {}",
            data.registration_id, data.scope
        );
        self.next_registration_id = self.next_registration_id.max(data.registration_id + 1);
        self.next_version_id = self.next_version_id.max(data.version_id + 1);

        let mut registration = ServiceWorkerRegistration::new(
            data.registration_id,
            data.scope.clone(),
            data.script.clone(),
            origin,
            data.last_update_check,
        );
        let mut version = self.new_version(
            data.version_id,
            data.registration_id,
            data.scope,
            data.script,
        );
        version.set_has_fetch_handler(data.has_fetch_handler);
        if data.is_active {
            version.restore_status(VersionStatus::Active);
            registration.set_active_version(version);
        } else {
            version.restore_status(VersionStatus::Installed);
            registration.set_waiting_version(version);
        }

        let info = registration.info();
        self.registrations.insert(data.registration_id, registration);
        Ok(info)
    }

    pub fn create_registration(
        &mut self,
        pattern: Url,
        script_url: Url,
    ) -> ServiceWorkerResult<RegistrationId> {
        let origin = origin_of(&pattern).ok_or_else(|| {
            ServiceWorkerError::Security(format!("{} has an opaque origin", pattern))
        })?;
        let registration_id = self.next_registration_id;
        self.next_registration_id += 1;

        info!("Created registration {} for {}", registration_id, pattern);
        self.registrations.insert(
            registration_id,
            ServiceWorkerRegistration::new(registration_id, pattern, script_url, origin, Utc::now()),
        );
        Ok(registration_id)
    }

    /// Create the version a register job installs and lend it the process
    /// ids of the job's callers
    pub fn create_installing_version(
        &mut self,
        pattern: &Url,
        job_id: JobId,
        registration_id: RegistrationId,
    ) -> ServiceWorkerResult<(VersionId, Vec<ProcessId>)> {
        let (scope, script_url) = self
            .registrations
            .get(&registration_id)
            .map(|registration| {
                (
                    registration.pattern().clone(),
                    registration.script_url().clone(),
                )
            })
            .ok_or(ServiceWorkerError::NotFound)?;

        let version_id = self.next_version_id;
        self.next_version_id += 1;
        let mut version = self.new_version(version_id, registration_id, scope, script_url);

        let lent = self.jobs.set_pending_version(pattern, job_id, version_id);
        for process_id in &lent {
            version.add_process_to_worker(*process_id);
        }

        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or(ServiceWorkerError::NotFound)?;
        registration.set_last_update_check(Utc::now());
        if let Some(mut replaced) = registration.set_installing_version(version) {
            replaced.shutdown();
        }
        debug!(
            "Version {} is installing for registration {}",
            version_id, registration_id
        );
        Ok((version_id, lent))
    }

    pub fn start_worker(
        &mut self,
        version_id: VersionId,
        candidate_process_ids: Vec<ProcessId>,
        callback: StatusCallback,
    ) {
        match self.version_mut(version_id) {
            Some(version) => version.start_worker_with_candidates(&candidate_process_ids, callback),
            None => callback(Err(ServiceWorkerError::NotFound)),
        }
    }

    pub fn stop_worker(&mut self, version_id: VersionId, callback: StatusCallback) {
        match self.version_mut(version_id) {
            Some(version) => version.stop_worker(callback),
            None => callback(Err(ServiceWorkerError::NotFound)),
        }
    }

    pub fn allocate_resource_id(&mut self) -> ResourceId {
        let resource_id = self.next_resource_id;
        self.next_resource_id += 1;
        resource_id
    }

    pub fn dispatch_install_event(&mut self, version_id: VersionId, callback: StatusCallback) {
        let active_version_id = self
            .registrations
            .values()
            .find(|registration| {
                registration
                    .versions()
                    .any(|version| version.version_id() == version_id)
            })
            .and_then(|registration| registration.active_version())
            .map(|version| version.version_id());

        match self.version_mut(version_id) {
            Some(version) => version.dispatch_install_event(active_version_id, callback),
            None => callback(Err(ServiceWorkerError::NotFound)),
        }
    }

    pub fn dispatch_activate_event(&mut self, version_id: VersionId, callback: StatusCallback) {
        match self.version_mut(version_id) {
            Some(version) => version.dispatch_activate_event(callback),
            None => callback(Err(ServiceWorkerError::NotFound)),
        }
    }

    pub fn dispatch_fetch_event(
        &mut self,
        registration_id: RegistrationId,
        request: FetchRequest,
        callback: FetchCallback,
    ) {
        match self
            .registrations
            .get_mut(&registration_id)
            .and_then(|registration| registration.active_version_mut())
        {
            Some(version) => version.dispatch_fetch_event(request, callback),
            None => callback(Err(ServiceWorkerError::NotFound)),
        }
    }

    pub fn dispatch_sync_event(&mut self, registration_id: RegistrationId, callback: StatusCallback) {
        match self
            .registrations
            .get_mut(&registration_id)
            .and_then(|registration| registration.active_version_mut())
        {
            Some(version) => version.dispatch_sync_event(callback),
            None => callback(Err(ServiceWorkerError::NotFound)),
        }
    }

    /// The record to persist for `version_id` once it has installed
    pub fn registration_data_for_store(
        &self,
        registration_id: RegistrationId,
        version_id: VersionId,
    ) -> ServiceWorkerResult<RegistrationData> {
        let registration = self
            .registrations
            .get(&registration_id)
            .ok_or(ServiceWorkerError::NotFound)?;
        let version = registration
            .versions()
            .find(|version| version.version_id() == version_id)
            .ok_or(ServiceWorkerError::NotFound)?;

        Ok(RegistrationData {
            registration_id,
            scope: registration.pattern().clone(),
            script: registration.script_url().clone(),
            version_id,
            is_active: false,
            has_fetch_handler: version.has_fetch_handler(),
            last_update_check: registration.last_update_check(),
        })
    }

    /// The installed version has been stored; it now waits
    pub fn promote_to_waiting(
        &mut self,
        registration_id: RegistrationId,
        version_id: VersionId,
    ) -> ServiceWorkerResult<()> {
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or(ServiceWorkerError::NotFound)?;
        if let Some(mut replaced) = registration.promote_to_waiting(version_id)? {
            replaced.shutdown();
        }
        let pattern = registration.pattern().clone();
        self.sender.notify(ContextEvent::RegistrationStored {
            registration_id,
            pattern,
        });
        Ok(())
    }

    /// The waiting version activated; the previous active version goes away
    pub fn activate_waiting_version(
        &mut self,
        registration_id: RegistrationId,
        version_id: VersionId,
    ) -> ServiceWorkerResult<()> {
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or(ServiceWorkerError::NotFound)?;
        if let Some(mut previous) = registration.promote_to_active(version_id)? {
            debug!(
                "Version {} replaces version {} in registration {}",
                version_id,
                previous.version_id(),
                registration_id
            );
            previous.shutdown();
        }
        Ok(())
    }

    /// Drop a version whose install failed. Returns true when the
    /// registration is left without an active version.
    pub fn abandon_version(
        &mut self,
        registration_id: RegistrationId,
        version_id: VersionId,
    ) -> bool {
        let Some(registration) = self.registrations.get_mut(&registration_id) else {
            return false;
        };
        if let Some(mut version) = registration.take_version(version_id) {
            version.shutdown();
        }
        registration.active_version().is_none()
    }

    /// Shut a live registration down and forget it
    pub fn remove_registration(&mut self, registration_id: RegistrationId) -> bool {
        let Some(mut registration) = self.registrations.remove(&registration_id) else {
            return false;
        };
        info!(
            "Removing registration {} for {}",
            registration_id,
            registration.pattern()
        );
        registration.shutdown();
        self.sender.notify(ContextEvent::RegistrationDeleted {
            registration_id,
            pattern: registration.pattern().clone(),
        });
        true
    }

    pub fn remove_registrations_for_origin(&mut self, origin: &str) -> Vec<RegistrationId> {
        let ids: Vec<RegistrationId> = self
            .registrations
            .values()
            .filter(|registration| registration.origin() == origin)
            .map(|registration| registration.registration_id())
            .collect();
        for registration_id in &ids {
            self.remove_registration(*registration_id);
        }
        ids
    }

    /// Keep jobs for `origin` from running and abort the running ones.
    /// Returns the aborted tasks; awaiting them guarantees none of them
    /// touches the store again.
    pub fn hold_origin(&mut self, origin: &str) -> Vec<JoinHandle<()>> {
        let aborted = self.jobs.hold_origin(origin);
        let mut tasks = Vec::new();
        for mut job in aborted {
            if let Some(version) = job
                .pending_version
                .and_then(|version_id| self.version_mut(version_id))
            {
                for process_id in &job.lent_process_ids {
                    version.remove_process_from_worker(*process_id);
                }
            }
            tasks.extend(job.task.take());
        }
        if !tasks.is_empty() {
            info!("Aborted {} running jobs for {}", tasks.len(), origin);
        }
        tasks
    }

    /// Release a hold taken by `hold_origin` and start the jobs it deferred
    pub fn release_origin(&mut self, origin: &str) {
        for pattern in self.jobs.release_origin(origin) {
            self.start_next_job(&pattern);
        }
    }

    pub fn schedule_register(
        &mut self,
        pattern: Url,
        script_url: Url,
        process_id: Option<ProcessId>,
        callback: RegistrationCallback,
    ) {
        let scheduled = self.jobs.schedule(
            JobKind::Register { script_url },
            pattern.clone(),
            process_id,
            callback,
        );
        self.on_scheduled(&pattern, scheduled, process_id);
    }

    pub fn schedule_unregister(&mut self, pattern: Url, callback: RegistrationCallback) {
        let scheduled = self
            .jobs
            .schedule(JobKind::Unregister, pattern.clone(), None, callback);
        self.on_scheduled(&pattern, scheduled, None);
    }

    /// A job finished: complete its callers and start the next one
    pub fn complete_job(
        &mut self,
        pattern: Url,
        job_id: JobId,
        result: ServiceWorkerResult<Option<RegistrationInfo>>,
    ) {
        let Some(job) = self.jobs.finish(&pattern, job_id) else {
            debug!("Ignoring completion of unknown job {}", job_id);
            return;
        };

        if let Some(version) = job
            .pending_version
            .and_then(|version_id| self.version_mut(version_id))
        {
            for process_id in &job.lent_process_ids {
                version.remove_process_from_worker(*process_id);
            }
        }

        match &result {
            Ok(_) => debug!("Job {} for {} completed", job_id, pattern),
            Err(e) => warn!("Job {} for {} failed: {}", job_id, pattern, e),
        }
        for callback in job.callbacks {
            callback(result.clone());
        }

        self.start_next_job(&pattern);
    }

    fn on_scheduled(&mut self, pattern: &Url, scheduled: Scheduled, process_id: Option<ProcessId>) {
        match scheduled {
            Scheduled::Joined {
                lend_to: Some(version_id),
                ..
            } => {
                if let (Some(process_id), Some(version)) = (process_id, self.version_mut(version_id))
                {
                    version.add_process_to_worker(process_id);
                }
            }
            Scheduled::Joined { .. } => {}
            Scheduled::Queued { runnable: true, .. } => self.start_next_job(pattern),
            Scheduled::Queued { .. } => {}
        }
    }

    fn start_next_job(&mut self, pattern: &Url) {
        let Some(job) = self.jobs.front(pattern) else {
            return;
        };
        if job.task.is_some() || self.jobs.is_held(pattern) {
            return;
        }

        let job_id = job.job_id;
        let context = JobContext {
            job_id,
            pattern: pattern.clone(),
            core: self.sender.clone(),
            store: self.store.clone(),
        };
        let task = match job.kind.clone() {
            JobKind::Register { script_url } => {
                tokio::spawn(RegisterJob::new(context, script_url).run())
            }
            JobKind::Unregister => tokio::spawn(UnregisterJob::new(context).run()),
        };
        self.jobs.set_task(pattern, job_id, task);
    }

    fn new_version(
        &mut self,
        version_id: VersionId,
        registration_id: RegistrationId,
        scope: Url,
        script_url: Url,
    ) -> ServiceWorkerVersion {
        let embedded_worker_id = self.next_embedded_worker_id;
        self.next_embedded_worker_id += 1;
        let instance = EmbeddedWorkerInstance::new(
            embedded_worker_id,
            self.host.clone(),
            self.process_manager.clone(),
            self.sender.clone(),
        );
        ServiceWorkerVersion::new(
            version_id,
            registration_id,
            scope,
            script_url,
            instance,
            self.sender.clone(),
        )
    }

    fn version_mut(&mut self, version_id: VersionId) -> Option<&mut ServiceWorkerVersion> {
        self.registrations
            .values_mut()
            .find_map(|registration| registration.version_mut(version_id))
    }

    fn version_for_worker_mut(
        &mut self,
        embedded_worker_id: EmbeddedWorkerId,
    ) -> Option<&mut ServiceWorkerVersion> {
        self.registrations
            .values_mut()
            .flat_map(|registration| registration.versions_mut())
            .find(|version| version.embedded_worker().embedded_worker_id() == embedded_worker_id)
    }

    fn on_process_allocated(
        &mut self,
        embedded_worker_id: EmbeddedWorkerId,
        result: ProcessResult<ProcessId>,
    ) {
        match self.version_for_worker_mut(embedded_worker_id) {
            Some(version) => version.on_process_allocated(result),
            None => {
                debug!(
                    "Process allocated for worker {} which no longer exists",
                    embedded_worker_id
                );
                if result.is_ok() {
                    self.process_manager.instance_stopped(embedded_worker_id);
                }
            }
        }
    }

    fn on_host_event(
        &mut self,
        process_id: ProcessId,
        embedded_worker_id: EmbeddedWorkerId,
        event: HostEvent,
    ) {
        let Some(version) = self.version_for_worker_mut(embedded_worker_id) else {
            debug!("Host event for unknown worker {}", embedded_worker_id);
            return;
        };
        if version.embedded_worker().process_id() != Some(process_id) {
            debug!(
                "Ignoring stale event for worker {} from process {}",
                embedded_worker_id, process_id
            );
            return;
        }

        let version_id = version.version_id();
        let notification = match event {
            HostEvent::WorkerStarted { thread_id } => version
                .on_worker_started(thread_id)
                .then_some(ContextEvent::WorkerStarted {
                    version_id,
                    embedded_worker_id,
                    process_id,
                    thread_id,
                }),
            HostEvent::WorkerStopped => {
                version.on_worker_stopped();
                Some(ContextEvent::WorkerStopped {
                    version_id,
                    embedded_worker_id,
                })
            }
            HostEvent::MessageReceived {
                request_id,
                message,
            } => {
                version.on_message_received(request_id, message);
                None
            }
            HostEvent::ReportException {
                error_message,
                line_number,
                column_number,
                source_url,
            } => {
                version.on_report_exception(
                    error_message.clone(),
                    line_number,
                    column_number,
                    source_url.clone(),
                );
                Some(ContextEvent::ErrorReported {
                    version_id,
                    error_message,
                    line_number,
                    column_number,
                    source_url,
                })
            }
        };

        if let Some(notification) = notification {
            self.sender.notify(notification);
        }
    }

    fn shutdown(&mut self) {
        info!(
            "Shutting down core domain ({} registrations, {} jobs)",
            self.registrations.len(),
            self.jobs.job_count()
        );
        self.jobs.abort_all();
        for (_, mut registration) in std::mem::take(&mut self.registrations) {
            registration.shutdown();
        }
    }
}

