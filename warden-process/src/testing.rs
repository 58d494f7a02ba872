//! In-memory process provider for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;
use warden_ipc::ProcessId;

use crate::provider::{HostProcess, ProcessProvider};

/// Host process that only counts worker references
#[derive(Debug)]
pub struct FakeProcess {
    id: ProcessId,
    worker_ref_count: AtomicI32,
}

impl FakeProcess {
    pub fn new(id: ProcessId) -> Arc<Self> {
        Arc::new(Self {
            id,
            worker_ref_count: AtomicI32::new(0),
        })
    }

    pub fn worker_ref_count(&self) -> i32 {
        self.worker_ref_count.load(Ordering::SeqCst)
    }
}

impl HostProcess for FakeProcess {
    fn id(&self) -> ProcessId {
        self.id
    }

    fn increment_worker_ref_count(&self) {
        self.worker_ref_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_worker_ref_count(&self) {
        self.worker_ref_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeProviderState {
    processes: HashMap<ProcessId, Arc<FakeProcess>>,
    created: Vec<ProcessId>,
    next_process_id: ProcessId,
    fail_creation: bool,
    fail_init: bool,
}

/// Process provider whose state stays inspectable after it has been handed
/// to a `ProcessManager`; clones share state.
#[derive(Clone)]
pub struct FakeProcessProvider {
    state: Arc<Mutex<FakeProviderState>>,
}

impl Default for FakeProcessProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessProvider {
    /// Provider with no processes; created processes are numbered from 1000
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProviderState {
                next_process_id: 1000,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeProviderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an already running process
    pub fn add_process(&self, process_id: ProcessId) -> Arc<FakeProcess> {
        let process = FakeProcess::new(process_id);
        self.state().processes.insert(process_id, process.clone());
        process
    }

    pub fn set_fail_creation(&self, fail: bool) {
        self.state().fail_creation = fail;
    }

    pub fn set_fail_init(&self, fail: bool) {
        self.state().fail_init = fail;
    }

    /// Ids of processes created through the provider, in creation order
    pub fn created_processes(&self) -> Vec<ProcessId> {
        self.state().created.clone()
    }

    pub fn worker_ref_count(&self, process_id: ProcessId) -> i32 {
        self.state()
            .processes
            .get(&process_id)
            .map(|process| process.worker_ref_count())
            .unwrap_or(0)
    }

    /// Sum of worker references over every known process
    pub fn live_references(&self) -> i32 {
        self.state()
            .processes
            .values()
            .map(|process| process.worker_ref_count())
            .sum()
    }
}

impl ProcessProvider for FakeProcessProvider {
    fn create_process_for_url(&mut self, _url: &Url) -> Option<Arc<dyn HostProcess>> {
        let mut state = self.state();
        if state.fail_creation {
            return None;
        }
        let process_id = state.next_process_id;
        state.next_process_id += 1;
        state.created.push(process_id);

        let process = FakeProcess::new(process_id);
        state.processes.insert(process_id, process.clone());
        Some(process as Arc<dyn HostProcess>)
    }

    fn init(&mut self, _process: &Arc<dyn HostProcess>) -> bool {
        !self.state().fail_init
    }

    fn lookup_process(&self, process_id: ProcessId) -> Option<Arc<dyn HostProcess>> {
        self.state()
            .processes
            .get(&process_id)
            .map(|process| process.clone() as Arc<dyn HostProcess>)
    }
}
