// src/services/html.rs

//! HTML result page source.
//!
//! Scrapes search result pages using configured CSS selectors.

use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Listing, SelectorConfig};
use crate::services::{Source, SourceQuery};
use crate::utils::http::fetch_text;
use crate::utils::{extract_listing_id, fallback_id, resolve_url};

struct Selectors {
    row: Selector,
    title: Selector,
    link: Option<Selector>,
    link_attr: String,
    id_attr: Option<String>,
    price: Option<Selector>,
    size: Option<Selector>,
    rooms: Option<Selector>,
    address: Option<Selector>,
}

impl Selectors {
    fn compile(config: &SelectorConfig) -> Result<Self> {
        let optional = |s: &Option<String>| s.as_deref().map(parse_selector).transpose();
        Ok(Self {
            row: parse_selector(&config.row)?,
            title: parse_selector(&config.title)?,
            link: optional(&config.link)?,
            link_attr: config.link_attr.clone(),
            id_attr: config.id_attr.clone(),
            price: optional(&config.price)?,
            size: optional(&config.size)?,
            rooms: optional(&config.rooms)?,
            address: optional(&config.address)?,
        })
    }
}

/// Source for sites without an API.
pub struct HtmlSource {
    name: String,
    client: Client,
    selectors: Selectors,
}

impl HtmlSource {
    pub fn new(name: impl Into<String>, client: Client, selectors: &SelectorConfig) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            client,
            selectors: Selectors::compile(selectors)?,
        })
    }

    /// Extract listings from one result page.
    pub fn parse_page(&self, html: &str, page_url: &str) -> Result<Vec<Listing>> {
        let base_url = Url::parse(page_url)?;
        let document = Html::parse_document(html);

        let listings = document
            .select(&self.selectors.row)
            .filter_map(|row| self.parse_row(&row, &base_url))
            .collect();
        Ok(listings)
    }

    fn parse_row(&self, row: &ElementRef, base_url: &Url) -> Option<Listing> {
        let sel = &self.selectors;
        let title_elem = row.select(&sel.title).next()?;
        let title = clean_text(title_elem);
        if title.is_empty() {
            return None;
        }

        let link_elem = sel
            .link
            .as_ref()
            .and_then(|s| row.select(s).next())
            .unwrap_or(title_elem);
        let raw_link = link_elem.value().attr(&sel.link_attr).unwrap_or("");
        if raw_link.is_empty() {
            log::debug!("[{}] skipping '{}': no link", self.name, title);
            return None;
        }
        let link = resolve_url(base_url, raw_link);

        let id = sel
            .id_attr
            .as_deref()
            .and_then(|attr| row.value().attr(attr))
            .map(str::to_string)
            .or_else(|| extract_listing_id(&link))
            .unwrap_or_else(|| fallback_id(&link));

        let text_of = |s: &Option<Selector>| {
            s.as_ref()
                .and_then(|s| row.select(s).next())
                .map(clean_text)
                .filter(|t| !t.is_empty())
        };

        let mut listing = Listing::new(&self.name, id, title, link);
        listing.price = text_of(&sel.price);
        listing.size = text_of(&sel.size);
        listing.rooms = text_of(&sel.rooms);
        listing.address = text_of(&sel.address);
        Some(listing)
    }
}

#[async_trait]
impl Source for HtmlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Listing>> {
        let mut listings = Vec::new();
        let mut last_error = None;

        for url in &query.urls {
            let page = match fetch_text(&self.client, url).await {
                Ok(page) => page,
                Err(e) => {
                    log::warn!("[{}] failed to fetch {}: {}", self.name, url, e);
                    last_error = Some(e);
                    continue;
                }
            };
            let found = self.parse_page(&page, url)?;
            log::debug!("[{}] {} listings on {}", self.name, found.len(), url);
            listings.extend(found);
        }

        match last_error {
            // Every page failed
            Some(e) if listings.is_empty() => Err(AppError::source(&self.name, e)),
            _ => Ok(listings),
        }
    }
}

/// Element text with whitespace collapsed.
fn clean_text(elem: ElementRef) -> String {
    elem.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}
