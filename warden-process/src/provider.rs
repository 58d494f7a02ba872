//! Seams to the embedder's process model

use std::sync::Arc;
use url::Url;
use warden_ipc::ProcessId;

/// A host process able to run workers
pub trait HostProcess: Send + Sync {
    fn id(&self) -> ProcessId;

    /// A worker now depends on this process staying alive
    fn increment_worker_ref_count(&self);

    /// A worker no longer depends on this process
    fn decrement_worker_ref_count(&self);
}

/// Creates and looks up host processes. Only used from the control domain.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessProvider: Send {
    /// Create a fresh process suitable for running `url`
    fn create_process_for_url(&mut self, url: &Url) -> Option<Arc<dyn HostProcess>>;

    /// Launch a freshly created process
    fn init(&mut self, process: &Arc<dyn HostProcess>) -> bool;

    /// An existing live process
    fn lookup_process(&self, process_id: ProcessId) -> Option<Arc<dyn HostProcess>>;
}
