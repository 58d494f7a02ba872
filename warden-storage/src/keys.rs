//! Key layout of the registration table.
//!
//! Ids are zero padded so that lexical key order matches numeric order.

use crate::records::{RegistrationId, ResourceId, VersionId};

pub const DATABASE_VERSION_KEY: &str = "INITDATA_DB_VERSION";
pub const NEXT_REGISTRATION_ID_KEY: &str = "INITDATA_NEXT_REGISTRATION_ID";
pub const NEXT_VERSION_ID_KEY: &str = "INITDATA_NEXT_VERSION_ID";
pub const NEXT_RESOURCE_ID_KEY: &str = "INITDATA_NEXT_RESOURCE_ID";
pub const UNIQUE_ORIGIN_PREFIX: &str = "INITDATA_UNIQUE_ORIGIN:";

pub const REGISTRATION_PREFIX: &str = "REG:";
pub const RESOURCE_PREFIX: &str = "RES:";
pub const UNCOMMITTED_RESOURCE_PREFIX: &str = "URES:";
pub const PURGEABLE_RESOURCE_PREFIX: &str = "PRES:";

const SEPARATOR: char = '|';

fn id_part(id: u64) -> String {
    format!("{:020}", id)
}

pub fn unique_origin_key(origin: &str) -> String {
    format!("{}{}", UNIQUE_ORIGIN_PREFIX, origin)
}

pub fn registration_key_prefix(origin: &str) -> String {
    format!("{}{}{}", REGISTRATION_PREFIX, origin, SEPARATOR)
}

pub fn registration_key(origin: &str, registration_id: RegistrationId) -> String {
    format!(
        "{}{}",
        registration_key_prefix(origin),
        id_part(registration_id)
    )
}

pub fn resource_key_prefix(version_id: VersionId) -> String {
    format!("{}{}{}", RESOURCE_PREFIX, id_part(version_id), SEPARATOR)
}

pub fn resource_key(version_id: VersionId, resource_id: ResourceId) -> String {
    format!("{}{}", resource_key_prefix(version_id), id_part(resource_id))
}

pub fn resource_id_key(prefix: &str, resource_id: ResourceId) -> String {
    format!("{}{}", prefix, id_part(resource_id))
}

/// Parse the id that follows `prefix` in `key`
pub fn parse_id(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.parse().ok()
}
