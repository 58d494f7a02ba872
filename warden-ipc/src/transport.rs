//! Transport from the core domain to the execution host

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::IpcError;
use crate::protocol::{HostCommand, MessageEnvelope, ProcessId};

/// Outbound channel to the execution host.
///
/// Sending never blocks: the command is queued for the host process and any
/// reply arrives later as a `HostEvent` on the core domain's mailbox.
pub trait ExecutionHost: Send + Sync {
    /// Queue `command` for delivery to the host running in `process_id`
    fn send(&self, process_id: ProcessId, command: HostCommand) -> Result<(), IpcError>;
}

/// One command addressed to a host process
#[derive(Debug, Clone, PartialEq)]
pub struct HostDelivery {
    pub process_id: ProcessId,
    pub command: HostCommand,
}

/// Execution host reached through an in-process channel.
///
/// The receiving half is handed to whatever drives the actual script
/// runtime; once it is dropped every send fails with `ConnectionClosed`.
#[derive(Debug, Clone)]
pub struct ChannelExecutionHost {
    sender: mpsc::UnboundedSender<MessageEnvelope<HostDelivery>>,
}

impl ChannelExecutionHost {
    /// Create the host and the receiver its commands are delivered to
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MessageEnvelope<HostDelivery>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ExecutionHost for ChannelExecutionHost {
    fn send(&self, process_id: ProcessId, command: HostCommand) -> Result<(), IpcError> {
        debug!(
            "Sending {:?} to worker {} in process {}",
            command,
            command.embedded_worker_id(),
            process_id
        );
        self.sender
            .send(MessageEnvelope::new(HostDelivery {
                process_id,
                command,
            }))
            .map_err(|_| IpcError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivery() {
        let (host, mut receiver) = ChannelExecutionHost::new();
        host.send(7, HostCommand::StopWorker { embedded_worker_id: 2 })
            .unwrap();

        let envelope = receiver.recv().await.unwrap();
        assert!(envelope.is_compatible());
        assert_eq!(envelope.message.process_id, 7);
        assert_eq!(
            envelope.message.command,
            HostCommand::StopWorker { embedded_worker_id: 2 }
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (host, receiver) = ChannelExecutionHost::new();
        drop(receiver);

        let result = host.send(1, HostCommand::StopWorker { embedded_worker_id: 1 });
        assert_eq!(result, Err(IpcError::ConnectionClosed));
    }
}
