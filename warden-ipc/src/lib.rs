//! Inter-process communication for Warden
//!
//! This crate provides the message protocol spoken between the core domain
//! and the execution host that runs worker scripts, along with the
//! transport abstraction the core uses to reach it.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    EmbeddedWorkerId, EventResult, FetchEventResult, FetchRequest, FetchResponse, HostCommand,
    HostEvent, HostEventMessage, MessageEnvelope, ProcessId, RequestId, ThreadId, WorkerRequest, WorkerResponse,
    IPC_PROTOCOL_VERSION,
};
pub use transport::{ChannelExecutionHost, ExecutionHost, HostDelivery};
