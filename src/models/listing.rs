//! Listing data structure.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder rendered for missing template values.
const MISSING: &str = "N/A";

/// Source-scoped listing identifier.
///
/// Sites use either numeric ids or opaque strings; both are keyed by their
/// textual rendering, so `42` and `"42"` from the same source are the same
/// listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ListingId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingId::Number(n) => write!(f, "{n}"),
            ListingId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ListingId {
    fn from(n: i64) -> Self {
        ListingId::Number(n)
    }
}

impl From<i32> for ListingId {
    fn from(n: i32) -> Self {
        ListingId::Number(i64::from(n))
    }
}

impl From<&str> for ListingId {
    fn from(s: &str) -> Self {
        ListingId::Text(s.to_string())
    }
}

impl From<String> for ListingId {
    fn from(s: String) -> Self {
        ListingId::Text(s)
    }
}

/// Dedup key: the source name plus the source-local id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId {
    pub source: String,
    pub id: String,
}

impl GlobalId {
    pub fn new(source: impl Into<String>, id: impl fmt::Display) -> Self {
        Self {
            source: source.into(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// A listing scraped from a source.
///
/// Identifying fields are fixed once the listing enters the pipeline; stages
/// only ever add annotations through [`Listing::annotate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listing {
    /// Source-local identifier
    pub id: ListingId,

    /// Name of the source that produced this listing
    #[serde(default)]
    pub source_name: String,

    /// Full URL to the listing
    #[serde(default)]
    pub url: String,

    /// Listing title
    #[serde(default)]
    pub title: String,

    /// Price as shown by the site, e.g. "450 €"
    #[serde(default)]
    pub price: Option<String>,

    /// Living space as shown by the site, e.g. "62 m²"
    #[serde(default)]
    pub size: Option<String>,

    /// Number of rooms as shown by the site, e.g. "2,5"
    #[serde(default)]
    pub rooms: Option<String>,

    /// Street address or district
    #[serde(default)]
    pub address: Option<String>,

    /// Source-specific fields
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Values added by pipeline stages
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl Listing {
    /// Create a listing with the identifying fields set.
    pub fn new(
        source_name: impl Into<String>,
        id: impl Into<ListingId>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_name: source_name.into(),
            url: url.into(),
            title: title.into(),
            price: None,
            size: None,
            rooms: None,
            address: None,
            attributes: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_rooms(mut self, rooms: impl Into<String>) -> Self {
        self.rooms = Some(rooms.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// The dedup key of this listing.
    pub fn global_id(&self) -> GlobalId {
        GlobalId::new(&self.source_name, &self.id)
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Add or replace an annotation.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Format the listing for display using a template.
    ///
    /// Supported placeholders:
    /// - `{id}`, `{source}` (alias `{crawler}`), `{title}`, `{url}`
    /// - `{price}`, `{size}`, `{rooms}`, `{address}`
    /// - any annotation or attribute key, annotations taking precedence
    ///
    /// Missing values render as `N/A`.
    pub fn format(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_placeholder(&after[..close]) => {
                    out.push_str(&self.placeholder(&after[..close]));
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out.trim().to_string()
    }

    fn placeholder(&self, key: &str) -> String {
        let value = match key {
            "id" => Some(self.id.to_string()),
            "source" | "crawler" => Some(self.source_name.clone()),
            "title" => Some(self.title.clone()),
            "url" => Some(self.url.clone()),
            "price" => self.price.clone(),
            "size" => self.size.clone(),
            "rooms" => self.rooms.clone(),
            "address" => self.address.clone(),
            other => self
                .annotations
                .get(other)
                .or_else(|| self.attributes.get(other))
                .cloned(),
        };
        value
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| MISSING.to_string())
    }
}

fn is_placeholder(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_listing() -> Listing {
        Listing::new("immo", 4711, "Sunny flat", "https://example.com/expose/4711")
            .with_price("850 €")
            .with_size("62 m²")
            .with_rooms("2")
    }

    #[test]
    fn test_global_id_combines_source_and_id() {
        let listing = sample_listing();
        assert_eq!(listing.global_id(), GlobalId::new("immo", "4711"));
        assert_eq!(listing.global_id().to_string(), "immo:4711");
    }

    #[test]
    fn test_numeric_and_text_ids_share_a_key() {
        let a = Listing::new("immo", 7, "a", "u");
        let b = Listing::new("immo", "7", "b", "u");
        assert_eq!(a.global_id(), b.global_id());
    }

    #[test]
    fn test_format() {
        let listing = sample_listing();
        let result = listing.format("[{source}] {title} - {price}");
        assert_eq!(result, "[immo] Sunny flat - 850 €");
    }

    #[test]
    fn test_format_missing_values_and_annotations() {
        let mut listing = sample_listing();
        listing.annotate("durations", "Work: 25 min");
        let result = listing.format("{address} | {durations} | {unknown}");
        assert_eq!(result, "N/A | Work: 25 min | N/A");
    }

    #[test]
    fn test_format_keeps_literal_braces() {
        let listing = sample_listing();
        assert_eq!(listing.format("{ {title} }"), "{ Sunny flat }");
    }

    #[test]
    fn test_deserialize_raw_record() {
        let json = r#"{"id": 12, "title": "Loft", "url": "https://x/12", "price": "1.200 €"}"#;
        let listing: Listing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.id, ListingId::Number(12));
        assert_eq!(listing.price.as_deref(), Some("1.200 €"));
        assert!(listing.annotations().is_empty());
    }
}
