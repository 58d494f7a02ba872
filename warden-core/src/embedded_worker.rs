//! The running instance of a worker script inside a host process

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;
use warden_ipc::{
    EmbeddedWorkerId, ExecutionHost, HostCommand, ProcessId, RequestId, ThreadId, WorkerRequest,
    WorkerResponse,
};
use warden_process::{ProcessManagerHandle, ProcessResult};
use warden_storage::VersionId;

use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::events::EmbeddedWorkerEvent;
use crate::mailbox::{CoreMessage, CoreSender};
use crate::observer::{ObserverId, ObserverList};

/// Running status of an embedded worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddedWorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What became of a start once the process allocation came back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The host has been asked to launch the worker
    Sent,
    /// The start failed and the instance is stopped again
    Failed(ServiceWorkerError),
    /// A stop arrived while allocating; the instance completed it locally
    Cancelled,
}

struct PendingStart {
    version_id: VersionId,
    scope: Url,
    script_url: Url,
}

/// Drives one worker through STOPPED → STARTING → RUNNING → STOPPING and
/// talks to the execution host on its behalf.
///
/// Lives on the core domain. Process allocation is requested from the
/// control domain and its reply comes back as a `CoreMessage`.
pub struct EmbeddedWorkerInstance {
    embedded_worker_id: EmbeddedWorkerId,
    status: EmbeddedWorkerStatus,
    process_id: Option<ProcessId>,
    thread_id: Option<ThreadId>,
    process_refs: BTreeMap<ProcessId, usize>,
    pending_start: Option<PendingStart>,
    observers: ObserverList<EmbeddedWorkerEvent>,
    host: Arc<dyn ExecutionHost>,
    process_manager: ProcessManagerHandle,
    core: CoreSender,
}

impl EmbeddedWorkerInstance {
    pub fn new(
        embedded_worker_id: EmbeddedWorkerId,
        host: Arc<dyn ExecutionHost>,
        process_manager: ProcessManagerHandle,
        core: CoreSender,
    ) -> Self {
        Self {
            embedded_worker_id,
            status: EmbeddedWorkerStatus::Stopped,
            process_id: None,
            thread_id: None,
            process_refs: BTreeMap::new(),
            pending_start: None,
            observers: ObserverList::new(),
            host,
            process_manager,
            core,
        }
    }

    pub fn embedded_worker_id(&self) -> EmbeddedWorkerId {
        self.embedded_worker_id
    }

    pub fn status(&self) -> EmbeddedWorkerStatus {
        self.status
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id
    }

    /// Ask the control domain for a process and launch the worker in it.
    ///
    /// Only valid while STOPPED. The allocation reply is delivered to the
    /// core domain as `CoreMessage::ProcessAllocated` and must be handed to
    /// `on_process_allocated`.
    pub fn start(
        &mut self,
        version_id: VersionId,
        scope: Url,
        script_url: Url,
        candidate_process_ids: &[ProcessId],
    ) -> ServiceWorkerResult<()> {
        if self.status != EmbeddedWorkerStatus::Stopped {
            return Err(ServiceWorkerError::StartWorkerFailed(format!(
                "worker {} is {:?}",
                self.embedded_worker_id, self.status
            )));
        }

        self.status = EmbeddedWorkerStatus::Starting;
        let candidates = self.sort_processes(candidate_process_ids);
        debug!(
            "Starting worker {} for version {} (candidates {:?})",
            self.embedded_worker_id, version_id, candidates
        );
        self.pending_start = Some(PendingStart {
            version_id,
            scope,
            script_url: script_url.clone(),
        });

        let core = self.core.clone();
        let embedded_worker_id = self.embedded_worker_id;
        self.process_manager.allocate_worker_process(
            embedded_worker_id,
            candidates,
            script_url,
            move |result| {
                core.send(CoreMessage::ProcessAllocated {
                    embedded_worker_id,
                    result,
                });
            },
        );
        Ok(())
    }

    pub fn on_process_allocated(&mut self, result: ProcessResult<ProcessId>) -> StartOutcome {
        match self.status {
            EmbeddedWorkerStatus::Starting => {}
            EmbeddedWorkerStatus::Stopping => {
                debug!(
                    "Worker {} was stopped while its process was being allocated",
                    self.embedded_worker_id
                );
                if result.is_ok() {
                    self.process_manager.instance_stopped(self.embedded_worker_id);
                }
                self.reset();
                self.observers.notify(EmbeddedWorkerEvent::Stopped);
                return StartOutcome::Cancelled;
            }
            status => {
                warn!(
                    "Ignoring process allocation for worker {} in status {:?}",
                    self.embedded_worker_id, status
                );
                if result.is_ok() {
                    self.process_manager.instance_stopped(self.embedded_worker_id);
                }
                return StartOutcome::Cancelled;
            }
        }

        let process_id = match result {
            Ok(process_id) => process_id,
            Err(e) => {
                self.reset();
                return StartOutcome::Failed(e.into());
            }
        };

        let Some(pending) = self.pending_start.take() else {
            self.process_manager.instance_stopped(self.embedded_worker_id);
            self.reset();
            return StartOutcome::Failed(ServiceWorkerError::StartWorkerFailed(
                "no start parameters".to_string(),
            ));
        };

        let command = HostCommand::StartWorker {
            embedded_worker_id: self.embedded_worker_id,
            version_id: pending.version_id,
            scope: pending.scope,
            script_url: pending.script_url,
        };
        match self.host.send(process_id, command) {
            Ok(()) => {
                self.process_id = Some(process_id);
                StartOutcome::Sent
            }
            Err(e) => {
                warn!(
                    "Failed to send start for worker {} to process {}: {}",
                    self.embedded_worker_id, process_id, e
                );
                self.process_manager.instance_stopped(self.embedded_worker_id);
                self.reset();
                StartOutcome::Failed(ServiceWorkerError::StartWorkerFailed(e.to_string()))
            }
        }
    }

    /// Ask the host to stop the worker.
    ///
    /// Before a process has been allocated this only moves to STOPPING;
    /// the stop completes when the allocation reply arrives.
    pub fn stop(&mut self) -> ServiceWorkerResult<()> {
        match self.status {
            EmbeddedWorkerStatus::Starting | EmbeddedWorkerStatus::Running => {}
            status => {
                return Err(ServiceWorkerError::InvalidState(format!(
                    "cannot stop worker {} in status {:?}",
                    self.embedded_worker_id, status
                )))
            }
        }

        if let Some(process_id) = self.process_id {
            self.host.send(
                process_id,
                HostCommand::StopWorker {
                    embedded_worker_id: self.embedded_worker_id,
                },
            )?;
            self.status = EmbeddedWorkerStatus::Stopping;
            self.process_manager.instance_will_stop(self.embedded_worker_id);
        } else {
            self.status = EmbeddedWorkerStatus::Stopping;
        }
        Ok(())
    }

    pub fn send_message(
        &self,
        request_id: RequestId,
        message: WorkerRequest,
    ) -> ServiceWorkerResult<()> {
        let (Some(process_id), Some(thread_id), EmbeddedWorkerStatus::Running) =
            (self.process_id, self.thread_id, self.status)
        else {
            return Err(ServiceWorkerError::InvalidState(format!(
                "worker {} is not running",
                self.embedded_worker_id
            )));
        };

        self.host.send(
            process_id,
            HostCommand::SendMessage {
                embedded_worker_id: self.embedded_worker_id,
                thread_id,
                request_id,
                message,
            },
        )?;
        Ok(())
    }

    /// The host reports the script is running. Returns false when the
    /// report is ignored.
    pub fn on_started(&mut self, thread_id: ThreadId) -> bool {
        match self.status {
            EmbeddedWorkerStatus::Starting if self.process_id.is_some() => {}
            EmbeddedWorkerStatus::Stopping => {
                debug!(
                    "Worker {} started after a stop was requested",
                    self.embedded_worker_id
                );
                return false;
            }
            status => {
                warn!(
                    "Unexpected start for worker {} in status {:?}",
                    self.embedded_worker_id, status
                );
                return false;
            }
        }

        self.status = EmbeddedWorkerStatus::Running;
        self.thread_id = Some(thread_id);
        self.observers
            .notify(EmbeddedWorkerEvent::Started { thread_id });
        true
    }

    pub fn on_stopped(&mut self) {
        if self.process_id.is_some() {
            self.process_manager.instance_stopped(self.embedded_worker_id);
        }
        self.reset();
        self.observers.notify(EmbeddedWorkerEvent::Stopped);
    }

    pub fn on_message_received(&mut self, request_id: RequestId, message: WorkerResponse) {
        self.observers.notify(EmbeddedWorkerEvent::MessageReceived {
            request_id,
            message,
        });
    }

    pub fn on_report_exception(
        &mut self,
        error_message: String,
        line_number: i32,
        column_number: i32,
        source_url: Option<Url>,
    ) {
        self.observers.notify(EmbeddedWorkerEvent::ReportException {
            error_message,
            line_number,
            column_number,
            source_url,
        });
    }

    pub fn add_process_reference(&mut self, process_id: ProcessId) {
        *self.process_refs.entry(process_id).or_insert(0) += 1;
    }

    pub fn release_process_reference(&mut self, process_id: ProcessId) {
        match self.process_refs.get_mut(&process_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.process_refs.remove(&process_id);
            }
            None => warn!(
                "Worker {} has no reference to process {}",
                self.embedded_worker_id, process_id
            ),
        }
    }

    pub fn process_reference_count(&self, process_id: ProcessId) -> usize {
        self.process_refs.get(&process_id).copied().unwrap_or(0)
    }

    pub fn has_process_to_run(&self) -> bool {
        !self.process_refs.is_empty()
    }

    pub fn add_observer(&mut self, sender: mpsc::UnboundedSender<EmbeddedWorkerEvent>) -> ObserverId {
        self.observers.add_observer(sender)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    /// Order processes to try: every candidate and every referenced process,
    /// most referenced first. A candidate counts as one extra reference;
    /// ties keep candidates first in the order given.
    fn sort_processes(&self, candidate_process_ids: &[ProcessId]) -> Vec<ProcessId> {
        let mut counted: Vec<(ProcessId, usize)> = Vec::new();
        for process_id in candidate_process_ids {
            match counted.iter_mut().find(|(id, _)| id == process_id) {
                Some((_, count)) => *count += 1,
                None => counted.push((*process_id, self.process_reference_count(*process_id) + 1)),
            }
        }
        for (process_id, count) in &self.process_refs {
            if !counted.iter().any(|(id, _)| id == process_id) {
                counted.push((*process_id, *count));
            }
        }

        counted.sort_by(|a, b| b.1.cmp(&a.1));
        counted.into_iter().map(|(process_id, _)| process_id).collect()
    }

    fn reset(&mut self) {
        self.status = EmbeddedWorkerStatus::Stopped;
        self.process_id = None;
        self.thread_id = None;
        self.pending_start = None;
    }
}

impl Drop for EmbeddedWorkerInstance {
    fn drop(&mut self) {
        if self.status == EmbeddedWorkerStatus::Stopped {
            return;
        }

        if let (Some(process_id), true) = (
            self.process_id,
            self.status != EmbeddedWorkerStatus::Stopping,
        ) {
            let _ = self.host.send(
                process_id,
                HostCommand::StopWorker {
                    embedded_worker_id: self.embedded_worker_id,
                },
            );
        }
        self.process_manager.instance_stopped(self.embedded_worker_id);
    }
}
