//! One version of a registration's worker script

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use url::Url;
use warden_ipc::{
    EmbeddedWorkerId, EventResult, FetchEventResult, FetchRequest, FetchResponse, ProcessId,
    RequestId, ThreadId, WorkerRequest, WorkerResponse,
};
use warden_process::ProcessResult;
use warden_storage::{RegistrationId, VersionId};

use crate::embedded_worker::{EmbeddedWorkerInstance, EmbeddedWorkerStatus, StartOutcome};
use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::events::ContextEvent;
use crate::mailbox::CoreSender;

/// Lifecycle status of a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    New,
    Installing,
    Installed,
    Activating,
    Active,
}

pub type StatusCallback = Box<dyn FnOnce(ServiceWorkerResult<()>) + Send>;
pub type MessageCallback = Box<dyn FnOnce(ServiceWorkerResult<WorkerResponse>) + Send>;
pub type FetchCallback = Box<dyn FnOnce(ServiceWorkerResult<FetchOutcome>) + Send>;

/// What a worker's fetch handler decided
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub result: FetchEventResult,
    pub response: Option<FetchResponse>,
}

/// Snapshot of a version for callers outside the core domain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionInfo {
    pub version_id: VersionId,
    pub registration_id: Option<RegistrationId>,
    pub script_url: Url,
    pub status: VersionStatus,
    pub running_status: EmbeddedWorkerStatus,
    pub embedded_worker_id: EmbeddedWorkerId,
    pub process_id: Option<ProcessId>,
    pub has_fetch_handler: bool,
}

#[derive(Debug, Clone, Copy)]
enum LifecyclePhase {
    Install,
    Activate,
}

impl LifecyclePhase {
    fn success_status(self) -> VersionStatus {
        match self {
            LifecyclePhase::Install => VersionStatus::Installed,
            LifecyclePhase::Activate => VersionStatus::Active,
        }
    }

    /// Status restored when the phase does not complete
    fn error_status(self) -> VersionStatus {
        match self {
            LifecyclePhase::Install => VersionStatus::New,
            LifecyclePhase::Activate => VersionStatus::Installed,
        }
    }

    fn rejection_error(self) -> ServiceWorkerError {
        match self {
            LifecyclePhase::Install => ServiceWorkerError::InstallWorkerFailed,
            LifecyclePhase::Activate => ServiceWorkerError::ActivateWorkerFailed,
        }
    }

    /// Returns the reported fetch handler flag for install replies
    fn read_reply(self, response: WorkerResponse) -> ServiceWorkerResult<Option<bool>> {
        match (self, response) {
            (
                LifecyclePhase::Install,
                WorkerResponse::InstallEventFinished {
                    result: EventResult::Completed,
                    has_fetch_handler,
                },
            ) => Ok(Some(has_fetch_handler)),
            (
                LifecyclePhase::Activate,
                WorkerResponse::ActivateEventFinished {
                    result: EventResult::Completed,
                },
            ) => Ok(None),
            (phase, response) => {
                debug!("{:?} phase failed with reply {:?}", phase, response);
                Err(phase.rejection_error())
            }
        }
    }
}

enum PendingRequest {
    Message(MessageCallback),
    Lifecycle {
        phase: LifecyclePhase,
        callback: StatusCallback,
    },
    Fetch(FetchCallback),
    Sync(StatusCallback),
}

enum StartWaiter {
    Callback(StatusCallback),
    Request {
        message: WorkerRequest,
        pending: PendingRequest,
    },
}

/// A version owns its embedded worker and everything waiting on it.
///
/// Starts and stops are coalesced: while one is in flight further callers
/// only queue a callback. Messages sent while the worker is not running
/// start it first. Every callback is eventually run exactly once.
pub struct ServiceWorkerVersion {
    version_id: VersionId,
    registration_id: Option<RegistrationId>,
    scope: Url,
    script_url: Url,
    status: VersionStatus,
    has_fetch_handler: bool,
    embedded_worker: EmbeddedWorkerInstance,
    start_callbacks: Vec<StartWaiter>,
    stop_callbacks: Vec<StatusCallback>,
    pending_requests: BTreeMap<RequestId, PendingRequest>,
    next_request_id: RequestId,
    core: CoreSender,
}

impl ServiceWorkerVersion {
    pub fn new(
        version_id: VersionId,
        registration_id: RegistrationId,
        scope: Url,
        script_url: Url,
        embedded_worker: EmbeddedWorkerInstance,
        core: CoreSender,
    ) -> Self {
        Self {
            version_id,
            registration_id: Some(registration_id),
            scope,
            script_url,
            status: VersionStatus::New,
            has_fetch_handler: false,
            embedded_worker,
            start_callbacks: Vec::new(),
            stop_callbacks: Vec::new(),
            pending_requests: BTreeMap::new(),
            next_request_id: 0,
            core,
        }
    }

    pub fn version_id(&self) -> VersionId {
        self.version_id
    }

    pub fn registration_id(&self) -> Option<RegistrationId> {
        self.registration_id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn status(&self) -> VersionStatus {
        self.status
    }

    pub fn running_status(&self) -> EmbeddedWorkerStatus {
        self.embedded_worker.status()
    }

    pub fn has_fetch_handler(&self) -> bool {
        self.has_fetch_handler
    }

    pub fn set_has_fetch_handler(&mut self, has_fetch_handler: bool) {
        self.has_fetch_handler = has_fetch_handler;
    }

    pub fn embedded_worker(&self) -> &EmbeddedWorkerInstance {
        &self.embedded_worker
    }

    pub fn embedded_worker_mut(&mut self) -> &mut EmbeddedWorkerInstance {
        &mut self.embedded_worker
    }

    pub fn info(&self) -> VersionInfo {
        VersionInfo {
            version_id: self.version_id,
            registration_id: self.registration_id,
            script_url: self.script_url.clone(),
            status: self.status,
            running_status: self.embedded_worker.status(),
            embedded_worker_id: self.embedded_worker.embedded_worker_id(),
            process_id: self.embedded_worker.process_id(),
            has_fetch_handler: self.has_fetch_handler,
        }
    }

    /// Change status and publish the transition
    pub fn set_status(&mut self, status: VersionStatus) {
        if self.status == status {
            return;
        }
        debug!(
            "Version {} status {:?} -> {:?}",
            self.version_id, self.status, status
        );
        self.status = status;
        self.core.notify(ContextEvent::VersionStatusChanged {
            version_id: self.version_id,
            registration_id: self.registration_id,
            status,
        });
    }

    /// Set the status of a version loaded from storage without publishing it
    pub fn restore_status(&mut self, status: VersionStatus) {
        self.status = status;
    }

    pub fn start_worker(&mut self, callback: StatusCallback) {
        self.start_worker_with_candidates(&[], callback)
    }

    /// Start the worker, preferring `candidate_process_ids`
    pub fn start_worker_with_candidates(
        &mut self,
        candidate_process_ids: &[ProcessId],
        callback: StatusCallback,
    ) {
        match self.embedded_worker.status() {
            EmbeddedWorkerStatus::Running => callback(Ok(())),
            EmbeddedWorkerStatus::Stopping => callback(Err(ServiceWorkerError::StartWorkerFailed(
                "worker is stopping".to_string(),
            ))),
            EmbeddedWorkerStatus::Stopped | EmbeddedWorkerStatus::Starting => {
                self.queue_start(StartWaiter::Callback(callback), candidate_process_ids)
            }
        }
    }

    pub fn stop_worker(&mut self, callback: StatusCallback) {
        let running_status = self.embedded_worker.status();
        if running_status == EmbeddedWorkerStatus::Stopped {
            callback(Ok(()));
            return;
        }

        let first = self.stop_callbacks.is_empty();
        self.stop_callbacks.push(callback);
        if !first || running_status == EmbeddedWorkerStatus::Stopping {
            return;
        }

        if let Err(e) = self.embedded_worker.stop() {
            warn!("Failed to stop worker for version {}: {}", self.version_id, e);
            for callback in std::mem::take(&mut self.stop_callbacks) {
                callback(Err(e.clone()));
            }
        }
    }

    /// Send `message` to the worker, starting it first if needed
    pub fn send_message(&mut self, message: WorkerRequest, callback: MessageCallback) {
        self.dispatch(message, PendingRequest::Message(callback));
    }

    /// Run the install event. Only valid for a NEW version.
    pub fn dispatch_install_event(
        &mut self,
        active_version_id: Option<VersionId>,
        callback: StatusCallback,
    ) {
        if self.status != VersionStatus::New {
            callback(Err(ServiceWorkerError::InvalidState(format!(
                "cannot install version {} in status {:?}",
                self.version_id, self.status
            ))));
            return;
        }
        self.set_status(VersionStatus::Installing);
        self.dispatch(
            WorkerRequest::InstallEvent { active_version_id },
            PendingRequest::Lifecycle {
                phase: LifecyclePhase::Install,
                callback,
            },
        );
    }

    /// Run the activate event. Only valid for an INSTALLED version.
    pub fn dispatch_activate_event(&mut self, callback: StatusCallback) {
        if self.status != VersionStatus::Installed {
            callback(Err(ServiceWorkerError::InvalidState(format!(
                "cannot activate version {} in status {:?}",
                self.version_id, self.status
            ))));
            return;
        }
        self.set_status(VersionStatus::Activating);
        self.dispatch(
            WorkerRequest::ActivateEvent,
            PendingRequest::Lifecycle {
                phase: LifecyclePhase::Activate,
                callback,
            },
        );
    }

    pub fn dispatch_fetch_event(&mut self, request: FetchRequest, callback: FetchCallback) {
        if self.status != VersionStatus::Active {
            callback(Err(self.not_active()));
            return;
        }
        self.dispatch(
            WorkerRequest::FetchEvent { request },
            PendingRequest::Fetch(callback),
        );
    }

    pub fn dispatch_sync_event(&mut self, callback: StatusCallback) {
        if self.status != VersionStatus::Active {
            callback(Err(self.not_active()));
            return;
        }
        self.dispatch(WorkerRequest::SyncEvent, PendingRequest::Sync(callback));
    }

    pub fn add_process_to_worker(&mut self, process_id: ProcessId) {
        self.embedded_worker.add_process_reference(process_id);
    }

    pub fn remove_process_from_worker(&mut self, process_id: ProcessId) {
        self.embedded_worker.release_process_reference(process_id);
    }

    pub fn on_process_allocated(&mut self, result: ProcessResult<ProcessId>) {
        match self.embedded_worker.on_process_allocated(result) {
            StartOutcome::Sent => {}
            StartOutcome::Failed(e) => {
                warn!("Worker for version {} failed to start: {}", self.version_id, e);
                self.fail_start_callbacks(e);
            }
            StartOutcome::Cancelled => self.flush_after_stop(),
        }
    }

    /// Returns false if the instance ignored the report
    pub fn on_worker_started(&mut self, thread_id: ThreadId) -> bool {
        if !self.embedded_worker.on_started(thread_id) {
            return false;
        }
        info!(
            "Worker for version {} running on thread {}",
            self.version_id, thread_id
        );

        for waiter in std::mem::take(&mut self.start_callbacks) {
            match waiter {
                StartWaiter::Callback(callback) => callback(Ok(())),
                StartWaiter::Request { message, pending } => self.send_now(message, pending),
            }
        }
        true
    }

    pub fn on_worker_stopped(&mut self) {
        self.embedded_worker.on_stopped();
        info!("Worker for version {} stopped", self.version_id);
        self.flush_after_stop();
    }

    pub fn on_message_received(&mut self, request_id: RequestId, message: WorkerResponse) {
        self.embedded_worker
            .on_message_received(request_id, message.clone());
        match self.pending_requests.remove(&request_id) {
            Some(pending) => self.complete_request(pending, Ok(message)),
            None => warn!(
                "Version {} received a reply to unknown request {}",
                self.version_id, request_id
            ),
        }
    }

    pub fn on_report_exception(
        &mut self,
        error_message: String,
        line_number: i32,
        column_number: i32,
        source_url: Option<Url>,
    ) {
        warn!(
            "Worker for version {} reported: {} ({}:{})",
            self.version_id, error_message, line_number, column_number
        );
        self.embedded_worker.on_report_exception(
            error_message,
            line_number,
            column_number,
            source_url,
        );
    }

    /// Detach from the registration and abort everything still waiting.
    ///
    /// The instance itself is released when the version is dropped.
    pub fn shutdown(&mut self) {
        debug!("Shutting down version {}", self.version_id);
        self.registration_id = None;
        for callback in std::mem::take(&mut self.stop_callbacks) {
            callback(Err(ServiceWorkerError::Abort));
        }
        self.fail_start_callbacks(ServiceWorkerError::Abort);
        self.abort_pending_requests();
    }

    fn not_active(&self) -> ServiceWorkerError {
        ServiceWorkerError::InvalidState(format!(
            "version {} is {:?}, not active",
            self.version_id, self.status
        ))
    }

    fn dispatch(&mut self, message: WorkerRequest, pending: PendingRequest) {
        match self.embedded_worker.status() {
            EmbeddedWorkerStatus::Running => self.send_now(message, pending),
            EmbeddedWorkerStatus::Stopping => self.complete_request(
                pending,
                Err(ServiceWorkerError::StartWorkerFailed(
                    "worker is stopping".to_string(),
                )),
            ),
            EmbeddedWorkerStatus::Stopped | EmbeddedWorkerStatus::Starting => {
                self.queue_start(StartWaiter::Request { message, pending }, &[])
            }
        }
    }

    fn queue_start(&mut self, waiter: StartWaiter, candidate_process_ids: &[ProcessId]) {
        self.start_callbacks.push(waiter);
        if self.embedded_worker.status() != EmbeddedWorkerStatus::Stopped {
            return;
        }

        let result = self.embedded_worker.start(
            self.version_id,
            self.scope.clone(),
            self.script_url.clone(),
            candidate_process_ids,
        );
        if let Err(e) = result {
            self.fail_start_callbacks(e);
        }
    }

    fn send_now(&mut self, message: WorkerRequest, pending: PendingRequest) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        match self.embedded_worker.send_message(request_id, message) {
            Ok(()) => {
                self.pending_requests.insert(request_id, pending);
            }
            Err(e) => self.complete_request(pending, Err(e)),
        }
    }

    fn complete_request(
        &mut self,
        pending: PendingRequest,
        result: ServiceWorkerResult<WorkerResponse>,
    ) {
        match pending {
            PendingRequest::Message(callback) => callback(result),
            PendingRequest::Lifecycle { phase, callback } => {
                match result.and_then(|response| phase.read_reply(response)) {
                    Ok(has_fetch_handler) => {
                        if let Some(has_fetch_handler) = has_fetch_handler {
                            self.has_fetch_handler = has_fetch_handler;
                        }
                        self.set_status(phase.success_status());
                        callback(Ok(()));
                    }
                    Err(e) => {
                        self.set_status(phase.error_status());
                        callback(Err(e));
                    }
                }
            }
            PendingRequest::Fetch(callback) => {
                callback(result.and_then(|response| match response {
                    WorkerResponse::FetchEventFinished { result, response } => {
                        Ok(FetchOutcome { result, response })
                    }
                    other => Err(ServiceWorkerError::Failed(format!(
                        "unexpected fetch reply {:?}",
                        other
                    ))),
                }))
            }
            PendingRequest::Sync(callback) => {
                callback(result.and_then(|response| match response {
                    WorkerResponse::SyncEventFinished => Ok(()),
                    other => Err(ServiceWorkerError::Failed(format!(
                        "unexpected sync reply {:?}",
                        other
                    ))),
                }))
            }
        }
    }

    fn fail_start_callbacks(&mut self, error: ServiceWorkerError) {
        for waiter in std::mem::take(&mut self.start_callbacks) {
            match waiter {
                StartWaiter::Callback(callback) => callback(Err(error.clone())),
                StartWaiter::Request { pending, .. } => {
                    self.complete_request(pending, Err(error.clone()))
                }
            }
        }
    }

    fn abort_pending_requests(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending_requests) {
            self.complete_request(pending, Err(ServiceWorkerError::Abort));
        }
    }

    fn flush_after_stop(&mut self) {
        for callback in std::mem::take(&mut self.stop_callbacks) {
            callback(Ok(()));
        }
        self.fail_start_callbacks(ServiceWorkerError::StartWorkerFailed(
            "worker stopped".to_string(),
        ));
        self.abort_pending_requests();
    }
}
