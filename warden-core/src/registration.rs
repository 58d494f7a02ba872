//! Live registrations and the versions they own

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;
use warden_storage::{RegistrationId, VersionId};

use crate::error::{ServiceWorkerError, ServiceWorkerResult};
use crate::version::{ServiceWorkerVersion, VersionInfo};

/// Snapshot of a registration for callers outside the core domain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationInfo {
    pub registration_id: RegistrationId,
    pub pattern: Url,
    pub script_url: Url,
    pub installing_version: Option<VersionInfo>,
    pub waiting_version: Option<VersionInfo>,
    pub active_version: Option<VersionInfo>,
    pub last_update_check: DateTime<Utc>,
}

impl RegistrationInfo {
    /// Newest version: installing, then waiting, then active
    pub fn newest_version(&self) -> Option<&VersionInfo> {
        self.installing_version
            .as_ref()
            .or(self.waiting_version.as_ref())
            .or(self.active_version.as_ref())
    }

    pub fn active_version_id(&self) -> Option<VersionId> {
        self.active_version.as_ref().map(|version| version.version_id)
    }
}

/// A scope pattern bound to a script, owning up to three versions
pub struct ServiceWorkerRegistration {
    registration_id: RegistrationId,
    pattern: Url,
    script_url: Url,
    origin: String,
    last_update_check: DateTime<Utc>,
    installing_version: Option<ServiceWorkerVersion>,
    waiting_version: Option<ServiceWorkerVersion>,
    active_version: Option<ServiceWorkerVersion>,
}

impl ServiceWorkerRegistration {
    pub fn new(
        registration_id: RegistrationId,
        pattern: Url,
        script_url: Url,
        origin: String,
        last_update_check: DateTime<Utc>,
    ) -> Self {
        Self {
            registration_id,
            pattern,
            script_url,
            origin,
            last_update_check,
            installing_version: None,
            waiting_version: None,
            active_version: None,
        }
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    pub fn pattern(&self) -> &Url {
        &self.pattern
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn last_update_check(&self) -> DateTime<Utc> {
        self.last_update_check
    }

    pub fn set_last_update_check(&mut self, time: DateTime<Utc>) {
        self.last_update_check = time;
    }

    pub fn installing_version(&self) -> Option<&ServiceWorkerVersion> {
        self.installing_version.as_ref()
    }

    pub fn waiting_version(&self) -> Option<&ServiceWorkerVersion> {
        self.waiting_version.as_ref()
    }

    pub fn active_version(&self) -> Option<&ServiceWorkerVersion> {
        self.active_version.as_ref()
    }

    pub fn active_version_mut(&mut self) -> Option<&mut ServiceWorkerVersion> {
        self.active_version.as_mut()
    }

    pub fn versions(&self) -> impl Iterator<Item = &ServiceWorkerVersion> {
        self.installing_version
            .iter()
            .chain(self.waiting_version.iter())
            .chain(self.active_version.iter())
    }

    pub fn versions_mut(&mut self) -> impl Iterator<Item = &mut ServiceWorkerVersion> {
        self.installing_version
            .iter_mut()
            .chain(self.waiting_version.iter_mut())
            .chain(self.active_version.iter_mut())
    }

    pub fn version_mut(&mut self, version_id: VersionId) -> Option<&mut ServiceWorkerVersion> {
        self.versions_mut()
            .find(|version| version.version_id() == version_id)
    }

    /// Put `version` in the installing slot, returning whatever it replaced
    pub fn set_installing_version(
        &mut self,
        version: ServiceWorkerVersion,
    ) -> Option<ServiceWorkerVersion> {
        self.installing_version.replace(version)
    }

    /// Put a stored version straight into the waiting slot
    pub fn set_waiting_version(
        &mut self,
        version: ServiceWorkerVersion,
    ) -> Option<ServiceWorkerVersion> {
        self.waiting_version.replace(version)
    }

    /// Put a stored version straight into the active slot
    pub fn set_active_version(
        &mut self,
        version: ServiceWorkerVersion,
    ) -> Option<ServiceWorkerVersion> {
        self.active_version.replace(version)
    }

    /// Move the installing version to waiting. Returns the previous
    /// waiting version.
    pub fn promote_to_waiting(
        &mut self,
        version_id: VersionId,
    ) -> ServiceWorkerResult<Option<ServiceWorkerVersion>> {
        match self.installing_version.take() {
            Some(version) if version.version_id() == version_id => {
                Ok(self.waiting_version.replace(version))
            }
            other => {
                self.installing_version = other;
                Err(ServiceWorkerError::InvalidState(format!(
                    "version {} is not installing in registration {}",
                    version_id, self.registration_id
                )))
            }
        }
    }

    /// Move the waiting version to active. Returns the previous active
    /// version.
    pub fn promote_to_active(
        &mut self,
        version_id: VersionId,
    ) -> ServiceWorkerResult<Option<ServiceWorkerVersion>> {
        match self.waiting_version.take() {
            Some(version) if version.version_id() == version_id => {
                Ok(self.active_version.replace(version))
            }
            other => {
                self.waiting_version = other;
                Err(ServiceWorkerError::InvalidState(format!(
                    "version {} is not waiting in registration {}",
                    version_id, self.registration_id
                )))
            }
        }
    }

    /// Remove a version from whichever slot holds it
    pub fn take_version(&mut self, version_id: VersionId) -> Option<ServiceWorkerVersion> {
        for slot in [
            &mut self.installing_version,
            &mut self.waiting_version,
            &mut self.active_version,
        ] {
            if slot.as_ref().map(|version| version.version_id()) == Some(version_id) {
                return slot.take();
            }
        }
        None
    }

    /// Shut every version down and drop them
    pub fn shutdown(&mut self) {
        for slot in [
            &mut self.installing_version,
            &mut self.waiting_version,
            &mut self.active_version,
        ] {
            if let Some(mut version) = slot.take() {
                version.shutdown();
            }
        }
    }

    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            registration_id: self.registration_id,
            pattern: self.pattern.clone(),
            script_url: self.script_url.clone(),
            installing_version: self.installing_version.as_ref().map(|v| v.info()),
            waiting_version: self.waiting_version.as_ref().map(|v| v.info()),
            active_version: self.active_version.as_ref().map(|v| v.info()),
            last_update_check: self.last_update_check,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden_ipc::ChannelExecutionHost;
    use warden_process::testing::FakeProcessProvider;
    use warden_process::ControlDomain;

    use crate::embedded_worker::EmbeddedWorkerInstance;
    use crate::mailbox::CoreSender;
    use crate::version::VersionStatus;

    fn pattern() -> Url {
        Url::parse("https://example.com/app/*").unwrap()
    }

    fn script() -> Url {
        Url::parse("https://example.com/app/worker.js").unwrap()
    }

    struct Versions {
        host: Arc<ChannelExecutionHost>,
        process_manager: warden_process::ProcessManagerHandle,
        core: CoreSender,
    }

    impl Versions {
        fn new() -> Self {
            let (host, _host_rx) = ChannelExecutionHost::new();
            let (core, _core_rx) = CoreSender::channel();
            Self {
                host: Arc::new(host),
                process_manager: ControlDomain::spawn(Box::new(FakeProcessProvider::new())),
                core,
            }
        }

        fn make(&self, version_id: VersionId) -> ServiceWorkerVersion {
            let instance = EmbeddedWorkerInstance::new(
                version_id as i32,
                self.host.clone(),
                self.process_manager.clone(),
                self.core.clone(),
            );
            ServiceWorkerVersion::new(version_id, 1, pattern(), script(), instance, self.core.clone())
        }
    }

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(
            1,
            pattern(),
            script(),
            "https://example.com".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_versions_move_through_slots() {
        let versions = Versions::new();
        let mut registration = registration();

        assert!(registration.set_installing_version(versions.make(1)).is_none());
        assert_eq!(registration.info().newest_version().unwrap().version_id, 1);

        assert!(registration.promote_to_waiting(1).unwrap().is_none());
        assert!(registration.installing_version().is_none());
        assert!(registration.promote_to_active(1).unwrap().is_none());
        assert_eq!(registration.info().active_version_id(), Some(1));

        registration.set_installing_version(versions.make(2));
        registration.promote_to_waiting(2).unwrap();
        let previous = registration.promote_to_active(2).unwrap();
        assert_eq!(previous.map(|v| v.version_id()), Some(1));
        assert_eq!(registration.info().active_version_id(), Some(2));
    }

    #[tokio::test]
    async fn test_promote_rejects_other_versions() {
        let versions = Versions::new();
        let mut registration = registration();
        registration.set_installing_version(versions.make(1));

        assert!(registration.promote_to_waiting(9).is_err());
        assert!(registration.promote_to_active(1).is_err());
        assert_eq!(
            registration.installing_version().map(|v| v.version_id()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_take_version_and_shutdown() {
        let versions = Versions::new();
        let mut registration = registration();
        registration.set_active_version(versions.make(1));
        registration.set_installing_version(versions.make(2));

        let taken = registration.take_version(2).unwrap();
        assert_eq!(taken.status(), VersionStatus::New);
        assert!(registration.take_version(2).is_none());
        assert!(registration.version_mut(1).is_some());

        registration.shutdown();
        assert_eq!(registration.versions().count(), 0);
    }
}
