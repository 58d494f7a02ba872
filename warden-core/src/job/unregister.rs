//! Unregister job

use tracing::{debug, info};

use super::{find_registration_for_pattern, JobContext};
use crate::error::{ServiceWorkerError, ServiceWorkerResult};

pub(crate) struct UnregisterJob {
    context: JobContext,
}

impl UnregisterJob {
    pub(crate) fn new(context: JobContext) -> Self {
        Self { context }
    }

    pub(crate) async fn run(self) {
        debug!(
            "Unregister job {} started for {}",
            self.context.job_id, self.context.pattern
        );
        let result = self.unregister().await.map(|()| None);
        self.context.complete(result);
    }

    async fn unregister(&self) -> ServiceWorkerResult<()> {
        let existing = match find_registration_for_pattern(
            &self.context.core,
            &self.context.store,
            &self.context.pattern,
        )
        .await
        {
            Ok(existing) => existing,
            Err(ServiceWorkerError::NotFound) => {
                debug!("Nothing registered for {}", self.context.pattern);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(
            "Unregistering registration {} for {}",
            existing.registration_id, self.context.pattern
        );
        self.context
            .delete_registration(existing.registration_id)
            .await
    }
}
