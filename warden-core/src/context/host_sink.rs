//! Entry point for notifications coming back from the execution host

use tracing::warn;
use url::Url;
use warden_ipc::{
    EmbeddedWorkerId, HostEvent, HostEventMessage, MessageEnvelope, ProcessId, RequestId,
    ThreadId, WorkerResponse, IPC_PROTOCOL_VERSION,
};

use crate::mailbox::{CoreMessage, CoreSender};

/// Cloneable handle the execution host uses to report on its workers.
///
/// Every event is queued to the core domain; delivery returns false once
/// the context has shut down.
#[derive(Clone)]
pub struct HostEventSink {
    core: CoreSender,
}

impl HostEventSink {
    pub(crate) fn new(core: CoreSender) -> Self {
        Self { core }
    }

    pub fn deliver(
        &self,
        process_id: ProcessId,
        embedded_worker_id: EmbeddedWorkerId,
        event: HostEvent,
    ) -> bool {
        self.core.send(CoreMessage::Host {
            process_id,
            embedded_worker_id,
            event,
        })
    }

    /// Deliver a versioned message, dropping it if the protocol version
    /// does not match ours
    pub fn deliver_envelope(&self, envelope: MessageEnvelope<HostEventMessage>) -> bool {
        if !envelope.is_compatible() {
            warn!(
                "Dropping host event with protocol version {} (expected {})",
                envelope.protocol_version, IPC_PROTOCOL_VERSION
            );
            return false;
        }
        let HostEventMessage {
            process_id,
            embedded_worker_id,
            event,
        } = envelope.message;
        self.deliver(process_id, embedded_worker_id, event)
    }

    pub fn worker_started(
        &self,
        process_id: ProcessId,
        embedded_worker_id: EmbeddedWorkerId,
        thread_id: ThreadId,
    ) -> bool {
        self.deliver(
            process_id,
            embedded_worker_id,
            HostEvent::WorkerStarted { thread_id },
        )
    }

    pub fn worker_stopped(&self, process_id: ProcessId, embedded_worker_id: EmbeddedWorkerId) -> bool {
        self.deliver(process_id, embedded_worker_id, HostEvent::WorkerStopped)
    }

    pub fn message_received(
        &self,
        process_id: ProcessId,
        embedded_worker_id: EmbeddedWorkerId,
        request_id: RequestId,
        message: WorkerResponse,
    ) -> bool {
        self.deliver(
            process_id,
            embedded_worker_id,
            HostEvent::MessageReceived {
                request_id,
                message,
            },
        )
    }

    pub fn report_exception(
        &self,
        process_id: ProcessId,
        embedded_worker_id: EmbeddedWorkerId,
        error_message: String,
        line_number: i32,
        column_number: i32,
        source_url: Option<Url>,
    ) -> bool {
        self.deliver(
            process_id,
            embedded_worker_id,
            HostEvent::ReportException {
                error_message,
                line_number,
                column_number,
                source_url,
            },
        )
    }
}
