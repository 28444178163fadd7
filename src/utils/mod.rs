//! Utility functions and helpers.

pub mod http;

use sha2::{Digest, Sha256};
use url::Url;

/// Resolve a potentially relative URL against a base URL.
pub fn resolve_url(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Extract a listing id from a listing URL.
///
/// Tries well-known query keys first, then path segments like
/// `/expose/123456` or `/wohnung-123456.html`.
pub fn extract_listing_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let mut fallback_keyed: Option<String> = None;

    for (key, value) in parsed.query_pairs() {
        if value.is_empty() {
            continue;
        }
        let key_lower = key.to_lowercase();

        if matches!(
            key_lower.as_str(),
            "id" | "exposeid" | "expose_id" | "listing_id" | "listingid" | "objectid" | "object_id"
        ) {
            return Some(value.to_string());
        }

        if fallback_keyed.is_none() && key_lower.ends_with("id") {
            fallback_keyed = Some(value.to_string());
        }
    }

    if let Some(value) = fallback_keyed {
        return Some(value);
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    // The last segment with a run of at least four digits: "/expose/123456"
    // or "/wohnung-123456.html"
    segments.iter().rev().find_map(|segment| {
        let digits = longest_digit_run(segment);
        (digits.len() >= 4).then(|| digits.to_string())
    })
}

fn longest_digit_run(text: &str) -> &str {
    text.split(|c: char| !c.is_ascii_digit())
        .max_by_key(|run| run.len())
        .unwrap_or("")
}

/// Stable id for listings whose URL carries none: a hash of the URL.
pub fn fallback_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}
