//! Control domain: the task that owns the `ProcessManager`

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;
use warden_ipc::{EmbeddedWorkerId, ProcessId};

use crate::error::{ProcessError, ProcessResult};
use crate::manager::ProcessManager;
use crate::provider::ProcessProvider;

/// Receives the outcome of an allocation, on the control domain task
pub type AllocationCallback = Box<dyn FnOnce(ProcessResult<ProcessId>) + Send>;

enum ControlMessage {
    Allocate {
        worker_id: EmbeddedWorkerId,
        candidate_process_ids: Vec<ProcessId>,
        script_url: Url,
        callback: AllocationCallback,
    },
    InstanceWillStop(EmbeddedWorkerId),
    InstanceStopped(EmbeddedWorkerId),
    SetProcessIdForTest(ProcessId),
    Shutdown(oneshot::Sender<()>),
}

/// Spawns the control domain
pub struct ControlDomain;

impl ControlDomain {
    /// Start the control domain around `provider`. Must be called inside a tokio runtime.
    pub fn spawn(provider: Box<dyn ProcessProvider>) -> ProcessManagerHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut manager = ProcessManager::new(provider);

        tokio::spawn(async move {
            debug!("Control domain started");
            while let Some(message) = receiver.recv().await {
                match message {
                    ControlMessage::Allocate {
                        worker_id,
                        candidate_process_ids,
                        script_url,
                        callback,
                    } => {
                        let result = manager.allocate_worker_process(
                            worker_id,
                            &candidate_process_ids,
                            &script_url,
                        );
                        if let Err(e) = &result {
                            warn!("Process allocation for worker {} failed: {}", worker_id, e);
                        }
                        callback(result);
                    }
                    ControlMessage::InstanceWillStop(worker_id) => {
                        manager.instance_will_stop(worker_id)
                    }
                    ControlMessage::InstanceStopped(worker_id) => {
                        manager.instance_stopped(worker_id)
                    }
                    ControlMessage::SetProcessIdForTest(process_id) => {
                        manager.set_process_id_for_test(process_id)
                    }
                    ControlMessage::Shutdown(reply) => {
                        manager.shutdown();
                        let _ = reply.send(());
                    }
                }
            }
            manager.shutdown();
            debug!("Control domain stopped");
        });

        ProcessManagerHandle { sender }
    }
}

/// Posts process-lifecycle work to the control domain. Calls never block;
/// results come back through callbacks run on the control domain task.
#[derive(Clone)]
pub struct ProcessManagerHandle {
    sender: mpsc::UnboundedSender<ControlMessage>,
}

impl ProcessManagerHandle {
    /// Allocate a process for `worker_id`; `callback` receives the result
    pub fn allocate_worker_process(
        &self,
        worker_id: EmbeddedWorkerId,
        candidate_process_ids: Vec<ProcessId>,
        script_url: Url,
        callback: impl FnOnce(ProcessResult<ProcessId>) + Send + 'static,
    ) {
        let message = ControlMessage::Allocate {
            worker_id,
            candidate_process_ids,
            script_url,
            callback: Box::new(callback),
        };
        if let Err(mpsc::error::SendError(ControlMessage::Allocate { callback, .. })) =
            self.sender.send(message)
        {
            callback(Err(ProcessError::ShuttingDown));
        }
    }

    /// Awaitable form of `allocate_worker_process`
    pub async fn allocate(
        &self,
        worker_id: EmbeddedWorkerId,
        candidate_process_ids: Vec<ProcessId>,
        script_url: Url,
    ) -> ProcessResult<ProcessId> {
        let (reply, response) = oneshot::channel();
        self.allocate_worker_process(worker_id, candidate_process_ids, script_url, move |result| {
            let _ = reply.send(result);
        });
        response.await.unwrap_or(Err(ProcessError::ShuttingDown))
    }

    pub fn instance_will_stop(&self, worker_id: EmbeddedWorkerId) {
        let _ = self.sender.send(ControlMessage::InstanceWillStop(worker_id));
    }

    pub fn instance_stopped(&self, worker_id: EmbeddedWorkerId) {
        let _ = self.sender.send(ControlMessage::InstanceStopped(worker_id));
    }

    pub fn set_process_id_for_test(&self, process_id: ProcessId) {
        let _ = self
            .sender
            .send(ControlMessage::SetProcessIdForTest(process_id));
    }

    /// Shut the manager down; resolves once every reference has been released
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.sender.send(ControlMessage::Shutdown(reply)).is_ok() {
            let _ = done.await;
        }
    }
}
