//! In-process stand-in for the execution host, for tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use warden_ipc::{
    ChannelExecutionHost, EventResult, FetchEventResult, FetchResponse, HostCommand, HostDelivery,
    MessageEnvelope, ThreadId, WorkerRequest, WorkerResponse,
};
use warden_process::testing::FakeProcessProvider;
use warden_storage::StorageLocation;

use crate::context::{HostEventSink, ServiceWorkerContext};

/// How the fake peer answers the commands it receives
#[derive(Debug, Clone)]
pub struct PeerBehavior {
    /// Report every started worker as stopped straight away
    pub fail_start: bool,
    pub install_result: EventResult,
    pub activate_result: EventResult,
    pub has_fetch_handler: bool,
    /// `None` makes fetch events fall back to the network
    pub fetch_response: Option<FetchResponse>,
    pub ack_start: bool,
    pub ack_stop: bool,
    /// Leave activate events unanswered, parking the version in ACTIVATING
    pub hold_activate: bool,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            fail_start: false,
            install_result: EventResult::Completed,
            activate_result: EventResult::Completed,
            has_fetch_handler: true,
            fetch_response: Some(FetchResponse {
                status_code: 200,
                status_text: "OK".to_string(),
                headers: BTreeMap::new(),
            }),
            ack_start: true,
            ack_stop: true,
            hold_activate: false,
        }
    }
}

struct PeerState {
    behavior: PeerBehavior,
    commands: Vec<HostDelivery>,
    start_count: usize,
    next_thread_id: ThreadId,
}

/// Consumes the commands sent to a `ChannelExecutionHost` and answers them
/// through a `HostEventSink`, the way a script runtime would
#[derive(Clone)]
pub struct FakeExecutionPeer {
    state: Arc<Mutex<PeerState>>,
}

impl FakeExecutionPeer {
    pub fn spawn(
        mut receiver: mpsc::UnboundedReceiver<MessageEnvelope<HostDelivery>>,
        sink: HostEventSink,
        behavior: PeerBehavior,
    ) -> Self {
        let state = Arc::new(Mutex::new(PeerState {
            behavior,
            commands: Vec::new(),
            start_count: 0,
            next_thread_id: 1,
        }));

        let task_state = state.clone();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let delivery = envelope.message;
                let mut state = lock(&task_state);
                state.commands.push(delivery.clone());
                respond(&mut state, &sink, delivery);
            }
        });

        Self { state }
    }

    pub fn set_behavior(&self, behavior: PeerBehavior) {
        lock(&self.state).behavior = behavior;
    }

    /// Every command received so far, in arrival order
    pub fn commands(&self) -> Vec<HostDelivery> {
        lock(&self.state).commands.clone()
    }

    /// Number of `StartWorker` commands received
    pub fn start_count(&self) -> usize {
        lock(&self.state).start_count
    }
}

fn lock(state: &Mutex<PeerState>) -> MutexGuard<'_, PeerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn respond(state: &mut PeerState, sink: &HostEventSink, delivery: HostDelivery) {
    let process_id = delivery.process_id;
    match delivery.command {
        HostCommand::StartWorker {
            embedded_worker_id, ..
        } => {
            state.start_count += 1;
            if state.behavior.fail_start {
                sink.worker_stopped(process_id, embedded_worker_id);
            } else if state.behavior.ack_start {
                let thread_id = state.next_thread_id;
                state.next_thread_id += 1;
                sink.worker_started(process_id, embedded_worker_id, thread_id);
            }
        }
        HostCommand::StopWorker { embedded_worker_id } => {
            if state.behavior.ack_stop {
                sink.worker_stopped(process_id, embedded_worker_id);
            }
        }
        HostCommand::SendMessage {
            embedded_worker_id,
            request_id,
            message,
            ..
        } => {
            let behavior = &state.behavior;
            if behavior.hold_activate && matches!(message, WorkerRequest::ActivateEvent) {
                return;
            }
            let response = match message {
                WorkerRequest::InstallEvent { .. } => WorkerResponse::InstallEventFinished {
                    result: behavior.install_result,
                    has_fetch_handler: behavior.has_fetch_handler,
                },
                WorkerRequest::ActivateEvent => WorkerResponse::ActivateEventFinished {
                    result: behavior.activate_result,
                },
                WorkerRequest::FetchEvent { .. } => WorkerResponse::FetchEventFinished {
                    result: if behavior.fetch_response.is_some() {
                        FetchEventResult::Response
                    } else {
                        FetchEventResult::Fallback
                    },
                    response: behavior.fetch_response.clone(),
                },
                WorkerRequest::SyncEvent => WorkerResponse::SyncEventFinished,
            };
            sink.message_received(process_id, embedded_worker_id, request_id, response);
        }
    }
}

/// A context wired to a fake process provider and a fake execution peer
pub struct TestHarness {
    pub context: ServiceWorkerContext,
    pub provider: FakeProcessProvider,
    pub peer: FakeExecutionPeer,
}

impl TestHarness {
    /// In-memory store, well-behaved peer
    pub async fn start() -> Self {
        Self::start_with(StorageLocation::InMemory, PeerBehavior::default()).await
    }

    pub async fn start_with(location: StorageLocation, behavior: PeerBehavior) -> Self {
        let provider = FakeProcessProvider::new();
        let (host, receiver) = ChannelExecutionHost::new();
        let context = ServiceWorkerContext::start_with_location(
            location,
            Box::new(provider.clone()),
            Arc::new(host),
        )
        .await;
        let peer = FakeExecutionPeer::spawn(receiver, context.host_event_sink(), behavior);
        Self {
            context,
            provider,
            peer,
        }
    }
}
