//! Events published to worker and context observers

use serde::Serialize;
use url::Url;
use warden_ipc::{EmbeddedWorkerId, ProcessId, RequestId, ThreadId, WorkerResponse};
use warden_storage::{RegistrationId, VersionId};

use crate::version::VersionStatus;

/// Notifications about one embedded worker instance
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddedWorkerEvent {
    Started {
        thread_id: ThreadId,
    },
    Stopped,
    MessageReceived {
        request_id: RequestId,
        message: WorkerResponse,
    },
    ReportException {
        error_message: String,
        line_number: i32,
        column_number: i32,
        source_url: Option<Url>,
    },
}

/// Notifications published by the service worker context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEvent {
    VersionStatusChanged {
        version_id: VersionId,
        registration_id: Option<RegistrationId>,
        status: VersionStatus,
    },
    RegistrationStored {
        registration_id: RegistrationId,
        pattern: Url,
    },
    RegistrationDeleted {
        registration_id: RegistrationId,
        pattern: Url,
    },
    WorkerStarted {
        version_id: VersionId,
        embedded_worker_id: EmbeddedWorkerId,
        process_id: ProcessId,
        thread_id: ThreadId,
    },
    WorkerStopped {
        version_id: VersionId,
        embedded_worker_id: EmbeddedWorkerId,
    },
    ErrorReported {
        version_id: VersionId,
        error_message: String,
        line_number: i32,
        column_number: i32,
        source_url: Option<Url>,
    },
}
