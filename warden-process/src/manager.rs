//! Worker to host process bookkeeping

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use warden_ipc::{EmbeddedWorkerId, ProcessId};

use crate::error::{ProcessError, ProcessResult};
use crate::provider::{HostProcess, ProcessProvider};

struct ProcessInfo {
    process: Arc<dyn HostProcess>,
    // Cleared once the worker reference has been given back
    has_reference: bool,
}

/// Tracks which host process every embedded worker runs in.
///
/// Each allocation takes one worker reference on its process. The reference
/// is dropped exactly once, either early by `instance_will_stop` or by
/// `instance_stopped`, whichever comes first.
pub struct ProcessManager {
    provider: Option<Box<dyn ProcessProvider>>,
    instance_info: HashMap<EmbeddedWorkerId, ProcessInfo>,
    process_id_for_test: Option<ProcessId>,
}

impl ProcessManager {
    pub fn new(provider: Box<dyn ProcessProvider>) -> Self {
        Self {
            provider: Some(provider),
            instance_info: HashMap::new(),
            process_id_for_test: None,
        }
    }

    /// Make every allocation succeed with `process_id` without touching the provider
    pub fn set_process_id_for_test(&mut self, process_id: ProcessId) {
        self.process_id_for_test = Some(process_id);
    }

    pub fn is_shutdown(&self) -> bool {
        self.provider.is_none()
    }

    /// Process currently associated with `worker_id`
    pub fn allocated_process(&self, worker_id: EmbeddedWorkerId) -> Option<ProcessId> {
        self.instance_info.get(&worker_id).map(|info| info.process.id())
    }

    /// Find or create a process for `worker_id`. Candidates are tried in order.
    pub fn allocate_worker_process(
        &mut self,
        worker_id: EmbeddedWorkerId,
        candidate_process_ids: &[ProcessId],
        script_url: &Url,
    ) -> ProcessResult<ProcessId> {
        if let Some(process_id) = self.process_id_for_test {
            return Ok(process_id);
        }

        let provider = self.provider.as_mut().ok_or(ProcessError::ShuttingDown)?;

        if self.instance_info.contains_key(&worker_id) {
            return Err(ProcessError::AlreadyAllocated(worker_id));
        }

        let existing = candidate_process_ids
            .iter()
            .find_map(|process_id| provider.lookup_process(*process_id));

        let process = match existing {
            Some(process) => {
                debug!(
                    "Reusing process {} for worker {}",
                    process.id(),
                    worker_id
                );
                process
            }
            None => {
                let process = provider
                    .create_process_for_url(script_url)
                    .ok_or_else(|| ProcessError::CreationFailed(script_url.to_string()))?;
                if !provider.init(&process) {
                    warn!("Failed to initialise process {}", process.id());
                    return Err(ProcessError::InitFailed(process.id()));
                }
                info!(
                    "Created process {} for worker {} ({})",
                    process.id(),
                    worker_id,
                    script_url
                );
                process
            }
        };

        process.increment_worker_ref_count();
        let process_id = process.id();
        self.instance_info.insert(
            worker_id,
            ProcessInfo {
                process,
                has_reference: true,
            },
        );
        Ok(process_id)
    }

    /// Give the worker's process reference back ahead of the stop handshake
    pub fn instance_will_stop(&mut self, worker_id: EmbeddedWorkerId) {
        if let Some(info) = self.instance_info.get_mut(&worker_id) {
            if info.has_reference {
                info.process.decrement_worker_ref_count();
                info.has_reference = false;
            }
        }
    }

    /// Forget the worker, releasing its reference if still held
    pub fn instance_stopped(&mut self, worker_id: EmbeddedWorkerId) {
        if let Some(info) = self.instance_info.remove(&worker_id) {
            if info.has_reference {
                info.process.decrement_worker_ref_count();
            }
        }
    }

    /// Release every reference and refuse further allocations
    pub fn shutdown(&mut self) {
        if self.provider.take().is_none() {
            return;
        }
        info!(
            "Shutting down process manager with {} tracked workers",
            self.instance_info.len()
        );
        for (_, info) in self.instance_info.drain() {
            if info.has_reference {
                info.process.decrement_worker_ref_count();
            }
        }
    }
}
