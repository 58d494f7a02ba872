//! Records persisted by the registration store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

pub type RegistrationId = u64;
pub type VersionId = u64;
pub type ResourceId = u64;

/// Durable description of one registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationData {
    pub registration_id: RegistrationId,
    pub scope: Url,
    pub script: Url,
    pub version_id: VersionId,
    pub is_active: bool,
    pub has_fetch_handler: bool,
    pub last_update_check: DateTime<Utc>,
}

impl RegistrationData {
    /// Origin the registration is filed under, if the scope has one
    pub fn origin(&self) -> Option<String> {
        origin_of(&self.scope)
    }
}

/// A stored script or import belonging to a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub url: Url,
}

/// Next ids the store will hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextAvailableIds {
    pub registration_id: RegistrationId,
    pub version_id: VersionId,
    pub resource_id: ResourceId,
}

impl Default for NextAvailableIds {
    fn default() -> Self {
        Self {
            registration_id: 1,
            version_id: 1,
            resource_id: 1,
        }
    }
}

/// Where the backing store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    InMemory,
    OnDisk { directory: PathBuf, file_name: String },
}

impl StorageLocation {
    /// Full path of the database file, if the store is on disk
    pub fn database_path(&self) -> Option<PathBuf> {
        match self {
            StorageLocation::InMemory => None,
            StorageLocation::OnDisk {
                directory,
                file_name,
            } => Some(directory.join(file_name)),
        }
    }
}

/// ASCII serialisation of the origin of `url`; `None` for opaque origins
pub fn origin_of(url: &Url) -> Option<String> {
    let origin = url.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        let url = Url::parse("https://example.com:8443/app/*").unwrap();
        assert_eq!(origin_of(&url).as_deref(), Some("https://example.com:8443"));

        let opaque = Url::parse("data:text/plain,hello").unwrap();
        assert_eq!(origin_of(&opaque), None);
    }

    #[test]
    fn test_database_path() {
        let location = StorageLocation::OnDisk {
            directory: PathBuf::from("/var/lib/warden"),
            file_name: "registrations.db".to_string(),
        };
        assert_eq!(
            location.database_path(),
            Some(PathBuf::from("/var/lib/warden/registrations.db"))
        );
        assert_eq!(StorageLocation::InMemory.database_path(), None);
    }
}
