//! Message passing into the core domain

use tokio::sync::{mpsc, oneshot};
use warden_ipc::{EmbeddedWorkerId, HostEvent, ProcessId};
use warden_process::ProcessResult;

use crate::context::ContextCore;
use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::events::ContextEvent;

/// Work run on the core domain task with exclusive access to its state
pub type CoreTask = Box<dyn FnOnce(&mut ContextCore) + Send>;

/// Completion handle passed to work that finishes asynchronously
pub type ReplyCallback<T> = Box<dyn FnOnce(ServiceWorkerResult<T>) + Send>;

/// Everything the core domain task processes, in arrival order
pub enum CoreMessage {
    Task(CoreTask),

    /// Reply from the control domain for an instance's process allocation
    ProcessAllocated {
        embedded_worker_id: EmbeddedWorkerId,
        result: ProcessResult<ProcessId>,
    },

    /// Notification from the execution host
    Host {
        process_id: ProcessId,
        embedded_worker_id: EmbeddedWorkerId,
        event: HostEvent,
    },

    /// Publish to context observers
    Notify(ContextEvent),

    Shutdown(oneshot::Sender<()>),
}

/// Cloneable sending half of the core domain mailbox
#[derive(Clone)]
pub struct CoreSender {
    sender: mpsc::UnboundedSender<CoreMessage>,
}

impl CoreSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queue a message; false once the core domain has stopped
    pub fn send(&self, message: CoreMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn post(&self, task: impl FnOnce(&mut ContextCore) + Send + 'static) -> bool {
        self.send(CoreMessage::Task(Box::new(task)))
    }

    pub fn notify(&self, event: ContextEvent) {
        let _ = self.send(CoreMessage::Notify(event));
    }

    /// Run `task` on the core domain and wait for its return value.
    ///
    /// Fails with `Abort` if the core domain stops before running it.
    pub async fn call<T, F>(&self, task: F) -> ServiceWorkerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ContextCore) -> T + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.post(move |core| {
            let _ = reply.send(task(core));
        });
        response.await.map_err(|_| ServiceWorkerError::Abort)
    }

    /// Run `task` on the core domain and wait until it, or whoever it hands
    /// the callback to, completes.
    ///
    /// A callback dropped without being run resolves to `Abort`.
    pub async fn call_with_callback<T, F>(&self, task: F) -> ServiceWorkerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ContextCore, ReplyCallback<T>) + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let callback: ReplyCallback<T> = Box::new(move |result| {
            let _ = reply.send(result);
        });
        self.post(move |core| task(core, callback));
        response.await.unwrap_or(Err(ServiceWorkerError::Abort))
    }
}
