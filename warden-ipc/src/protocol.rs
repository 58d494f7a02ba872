//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Identifies one embedded worker instance across both sides of the channel
pub type EmbeddedWorkerId = i32;

/// Identifies a host process
pub type ProcessId = i32;

/// Identifies the execution thread a worker runs on inside its process
pub type ThreadId = i32;

/// Correlates a request sent to a worker with its reply
pub type RequestId = i32;

/// Commands sent from the core domain to the execution host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    /// Launch a worker for a version
    StartWorker {
        embedded_worker_id: EmbeddedWorkerId,
        version_id: u64,
        scope: Url,
        script_url: Url,
    },

    /// Tear a running worker down
    StopWorker { embedded_worker_id: EmbeddedWorkerId },

    /// Deliver a request to a running worker
    SendMessage {
        embedded_worker_id: EmbeddedWorkerId,
        thread_id: ThreadId,
        request_id: RequestId,
        message: WorkerRequest,
    },
}

impl HostCommand {
    /// Worker the command is addressed to
    pub fn embedded_worker_id(&self) -> EmbeddedWorkerId {
        match self {
            HostCommand::StartWorker {
                embedded_worker_id, ..
            }
            | HostCommand::StopWorker { embedded_worker_id }
            | HostCommand::SendMessage {
                embedded_worker_id, ..
            } => *embedded_worker_id,
        }
    }
}

/// Notifications emitted by the execution host about one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// The worker script is running on `thread_id`
    WorkerStarted { thread_id: ThreadId },

    /// The worker has gone away
    WorkerStopped,

    /// Reply to an earlier request
    MessageReceived {
        request_id: RequestId,
        message: WorkerResponse,
    },

    /// Uncaught exception inside the worker script
    ReportException {
        error_message: String,
        line_number: i32,
        column_number: i32,
        source_url: Option<Url>,
    },
}

/// A `HostEvent` together with the worker and process it concerns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEventMessage {
    pub process_id: ProcessId,
    pub embedded_worker_id: EmbeddedWorkerId,
    pub event: HostEvent,
}

/// Lifecycle and functional events delivered to a worker script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    InstallEvent { active_version_id: Option<u64> },
    ActivateEvent,
    FetchEvent { request: FetchRequest },
    SyncEvent,
}

/// Replies a worker script sends back for a `WorkerRequest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    InstallEventFinished {
        result: EventResult,
        has_fetch_handler: bool,
    },
    ActivateEventFinished {
        result: EventResult,
    },
    FetchEventFinished {
        result: FetchEventResult,
        response: Option<FetchResponse>,
    },
    SyncEventFinished,
}

/// Outcome of an install or activate event handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResult {
    Completed,
    Rejected,
}

/// Whether a fetch handler produced a response or let the request fall through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchEventResult {
    Fallback,
    Response,
}

/// Request handed to a worker's fetch handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub referrer: Option<Url>,
}

impl FetchRequest {
    /// Plain GET request for `url`
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            referrer: None,
        }
    }
}

/// Response synthesised by a worker's fetch handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status_code: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
