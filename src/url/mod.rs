//! URL handling module for Sumi-Harvest
//!
//! Seeds and discovered links are normalized before they become record keys,
//! so the same page reached through different spellings maps to one record.

mod normalize;

pub use normalize::normalize_url;

use url::Url;

/// Lowercased host of `url`, if it parses and has one
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// Returns true if both URLs parse and share a host
pub fn same_host(a: &str, b: &str) -> bool {
    match (host_of(a), host_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
