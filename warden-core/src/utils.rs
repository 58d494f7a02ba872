//! Scope pattern helpers

use url::Url;
use warden_storage::origin_of;

/// Whether `url` falls under `pattern`. A trailing `*` matches any suffix;
/// otherwise the match is exact.
pub fn scope_matches(pattern: &Url, url: &Url) -> bool {
    match pattern.as_str().strip_suffix('*') {
        Some(prefix) => url.as_str().starts_with(prefix),
        None => url.as_str() == pattern.as_str(),
    }
}

/// Whether both URLs have the same, non-opaque, origin
pub fn same_origin(a: &Url, b: &Url) -> bool {
    match (origin_of(a), origin_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
