//! Register and unregister jobs
//!
//! Jobs run as tokio tasks. Every step that touches live objects is posted
//! to the core domain; store work goes through the `RegistrationStore`.
//! A finished job reports back to the core domain, which completes every
//! caller that joined it and starts the next job for the same pattern.

mod coordinator;
mod register;
mod unregister;

pub use coordinator::{JobCoordinator, JobEntry, JobId, JobKind, RegistrationCallback, Scheduled};
pub(crate) use register::RegisterJob;
pub(crate) use unregister::UnregisterJob;

use url::Url;
use warden_storage::{origin_of, RegistrationId, RegistrationStore};

use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::mailbox::CoreSender;
use crate::registration::RegistrationInfo;

/// What a running job needs to reach the core domain and the store
#[derive(Clone)]
pub(crate) struct JobContext {
    pub job_id: JobId,
    pub pattern: Url,
    pub core: CoreSender,
    pub store: RegistrationStore,
}

impl JobContext {
    /// Hand the result to the core domain
    pub(crate) fn complete(&self, result: ServiceWorkerResult<Option<RegistrationInfo>>) {
        let pattern = self.pattern.clone();
        let job_id = self.job_id;
        self.core
            .post(move |core| core.complete_job(pattern, job_id, result));
    }

    pub(crate) fn origin(&self) -> ServiceWorkerResult<String> {
        origin_of(&self.pattern).ok_or_else(|| {
            ServiceWorkerError::Security(format!("{} has an opaque origin", self.pattern))
        })
    }

    /// Delete a registration from the store, then from the live set
    pub(crate) async fn delete_registration(
        &self,
        registration_id: RegistrationId,
    ) -> ServiceWorkerResult<()> {
        self.store
            .delete_registration(registration_id, self.origin()?)
            .await?;
        self.core
            .call(move |core| core.remove_registration(registration_id))
            .await?;
        Ok(())
    }
}

/// Find the registration for exactly `pattern`, adopting a stored one into
/// the live set when it is not loaded yet
pub(crate) async fn find_registration_for_pattern(
    core: &CoreSender,
    store: &RegistrationStore,
    pattern: &Url,
) -> ServiceWorkerResult<RegistrationInfo> {
    let lookup = pattern.clone();
    if let Some(info) = core
        .call(move |core| core.live_registration_for_pattern(&lookup))
        .await?
    {
        return Ok(info);
    }

    let origin = origin_of(pattern).ok_or(ServiceWorkerError::NotFound)?;
    let data = store
        .get_registrations_for_origin(origin)
        .await?
        .into_iter()
        .find(|data| data.scope == *pattern)
        .ok_or(ServiceWorkerError::NotFound)?;

    core.call(move |core| core.adopt_stored_registration(data))
        .await?
}
