//! Background worker registration and lifecycle for Warden
//!
//! A registration binds a URL pattern to a worker script. Registering runs
//! a job that starts the script in a host process, delivers the install
//! and activate events and persists the result. Once active, the version
//! receives fetch and sync events for documents under its pattern.
//!
//! All live objects belong to the core domain task. Clients use the
//! cloneable `ServiceWorkerContext`; the execution host reports back
//! through a `HostEventSink`.

pub mod context;
pub mod embedded_worker;
pub mod error;
pub mod events;
pub mod job;
pub mod mailbox;
pub mod observer;
pub mod registration;
pub mod utils;
pub mod version;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use context::{storage_location, ContextCore, HostEventSink, ServiceWorkerContext};
pub use embedded_worker::{EmbeddedWorkerInstance, EmbeddedWorkerStatus};
pub use error::{ServiceWorkerError, ServiceWorkerResult};
pub use events::{ContextEvent, EmbeddedWorkerEvent};
pub use registration::{RegistrationInfo, ServiceWorkerRegistration};
pub use version::{FetchOutcome, ServiceWorkerVersion, VersionInfo, VersionStatus};
