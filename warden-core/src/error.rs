//! Errors reported to registration and worker clients

use thiserror::Error;
use warden_ipc::IpcError;
use warden_process::ProcessError;
use warden_storage::StorageError;

/// Service worker result type
pub type ServiceWorkerResult<T> = Result<T, ServiceWorkerError>;

/// Outcome codes delivered to every callback in the core domain.
///
/// Cloneable so a single job result can be fanned out to every caller that
/// joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("No matching registration")]
    NotFound,

    #[error("Operation aborted")]
    Abort,

    #[error("Failed to start worker: {0}")]
    StartWorkerFailed(String),

    #[error("Worker rejected the install event")]
    InstallWorkerFailed,

    #[error("Worker rejected the activate event")]
    ActivateWorkerFailed,

    #[error("Registration store is disabled")]
    StoreDisabled,

    #[error("Registration store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("Process not found")]
    ProcessNotFound,

    #[error("IPC failure: {0}")]
    IpcFailed(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl ServiceWorkerError {
    /// Stable code for logs and host-facing responses
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceWorkerError::NotFound => "NOT_FOUND",
            ServiceWorkerError::Abort => "ABORT",
            ServiceWorkerError::StartWorkerFailed(_) => "START_WORKER_FAILED",
            ServiceWorkerError::InstallWorkerFailed => "INSTALL_FAILED",
            ServiceWorkerError::ActivateWorkerFailed => "ACTIVATE_FAILED",
            ServiceWorkerError::StoreDisabled => "STORE_DISABLED",
            ServiceWorkerError::StoreCorrupt(_) => "STORE_CORRUPT",
            ServiceWorkerError::ProcessNotFound => "PROCESS_NOT_FOUND",
            ServiceWorkerError::IpcFailed(_) => "IPC_FAILED",
            ServiceWorkerError::Security(_) => "SECURITY",
            ServiceWorkerError::InvalidState(_) => "INVALID_STATE",
            ServiceWorkerError::Failed(_) => "FAILED",
        }
    }

    /// Whether the error came from the registration store being unusable
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            ServiceWorkerError::StoreDisabled | ServiceWorkerError::StoreCorrupt(_)
        )
    }
}

impl From<StorageError> for ServiceWorkerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ServiceWorkerError::NotFound,
            StorageError::Corrupted(message) => ServiceWorkerError::StoreCorrupt(message),
            _ => ServiceWorkerError::StoreDisabled,
        }
    }
}

impl From<ProcessError> for ServiceWorkerError {
    fn from(err: ProcessError) -> Self {
        ServiceWorkerError::StartWorkerFailed(err.to_string())
    }
}

impl From<IpcError> for ServiceWorkerError {
    fn from(err: IpcError) -> Self {
        ServiceWorkerError::IpcFailed(err.to_string())
    }
}
