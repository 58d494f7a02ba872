//! Host process allocation for Warden
//!
//! The `ProcessManager` decides which host process an embedded worker runs
//! in and keeps the per-process worker reference counts. It is owned by the
//! control domain task; everything else talks to it through a
//! `ProcessManagerHandle`.

pub mod domain;
pub mod error;
pub mod manager;
pub mod provider;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use domain::{AllocationCallback, ControlDomain, ProcessManagerHandle};
pub use error::{ProcessError, ProcessResult};
pub use manager::ProcessManager;
pub use provider::{HostProcess, ProcessProvider};
