//! JSON listing feeds, over HTTP or from disk.
//!
//! A feed is either an array of listing records or an object with a
//! `listings` array:
//!
//! ```json
//! {"listings": [{"id": 42, "title": "Loft", "url": "https://…", "price": "900 €"}]}
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::services::{Source, SourceQuery};
use crate::utils::http::fetch_text;

#[derive(Deserialize)]
#[serde(untagged)]
enum Feed {
    Bare(Vec<Listing>),
    Wrapped { listings: Vec<Listing> },
}

/// Parse a JSON feed document.
pub fn parse_feed(text: &str) -> Result<Vec<Listing>> {
    let feed: Feed = serde_json::from_str(text)?;
    Ok(match feed {
        Feed::Bare(listings) | Feed::Wrapped { listings } => listings,
    })
}

/// Source for sites with a JSON search API.
pub struct JsonFeedSource {
    name: String,
    client: Client,
}

impl JsonFeedSource {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl Source for JsonFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Listing>> {
        let mut listings = Vec::new();
        for url in &query.urls {
            let text = fetch_text(&self.client, url).await?;
            let found = parse_feed(&text)
                .map_err(|e| AppError::source(&self.name, format!("bad feed at {url}: {e}")))?;
            listings.extend(found);
        }
        Ok(listings)
    }
}

/// Reads feeds from local files. Useful for replaying captured results.
pub struct FileSource {
    name: String,
    base_dir: Option<PathBuf>,
}

impl FileSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_dir: None,
        }
    }

    /// Resolve relative paths against this directory.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Listing>> {
        let mut listings = Vec::new();
        for path in &query.urls {
            let path = self.resolve(path);
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                AppError::source(&self.name, format!("cannot read {}: {e}", path.display()))
            })?;
            let found = parse_feed(&text).map_err(|e| {
                AppError::source(&self.name, format!("bad feed in {}: {e}", path.display()))
            })?;
            listings.extend(found);
        }
        Ok(listings)
    }
}
