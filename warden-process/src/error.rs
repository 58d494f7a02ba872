//! Process allocation errors

use thiserror::Error;
use warden_ipc::{EmbeddedWorkerId, ProcessId};

/// Process allocation result type
pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Process manager is shutting down")]
    ShuttingDown,

    #[error("Failed to create a process for {0}")]
    CreationFailed(String),

    #[error("Failed to initialise process {0}")]
    InitFailed(ProcessId),

    #[error("Worker {0} already has a process")]
    AlreadyAllocated(EmbeddedWorkerId),
}
