//! Source adapter contract and the NoFluffJobs listing/posting parsers.

use std::collections::HashSet;

use async_trait::async_trait;
use jobharvest_core::PostingDraft;
use jobharvest_storage::PageSource;
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

mod discovery;
mod links;
mod posting;

pub use discovery::{listing_targets, DiscoveryConfig, DEFAULT_CATEGORIES};
pub use links::{canonical_posting_url, extract_posting_links};
pub use posting::{parse_posting, REMOTE_HINTS};

pub const CRATE_NAME: &str = "jobharvest-adapters";

pub const NOFLUFFJOBS_SOURCE_ID: &str = "nofluffjobs";
pub const NOFLUFFJOBS_ORIGIN: &str = "https://nofluffjobs.com";

lazy_static! {
    pub(crate) static ref ORIGIN_URL: Url = Url::parse(NOFLUFFJOBS_ORIGIN).unwrap();
    static ref TAG_LIKE: Regex = Regex::new(r"<[a-zA-Z/][^>]*>").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
    pub category: Option<String>,
    pub remote: bool,
    pub page: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Listing pages to scan. Order carries no meaning.
    async fn discover_listings(
        &self,
        pages: &dyn PageSource,
        config: &DiscoveryConfig,
    ) -> Result<Vec<ListingTarget>, AdapterError>;

    /// Absolute, canonical posting URLs found on a listing page, first-seen order.
    fn parse_listing(&self, markup: &str) -> Result<Vec<String>, AdapterError>;

    /// `None` when the page yields no usable title.
    fn parse_detail(&self, markup: &str, url: &str) -> Result<Option<PostingDraft>, AdapterError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFluffJobsAdapter;

impl NoFluffJobsAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn discover_categories(
        &self,
        pages: &dyn PageSource,
        config: &DiscoveryConfig,
    ) -> Result<Vec<String>, AdapterError> {
        let mut found = Vec::new();
        for root in discovery::navigation_roots(&config.country) {
            let Some(markup) = pages.fetch_page(&root).await.into_body() else {
                debug!(url = %root, "navigation page unavailable");
                continue;
            };
            found.extend(discovery::category_slugs(&markup, &config.country)?);
        }
        let mut seen = HashSet::new();
        found.retain(|slug| seen.insert(slug.clone()));
        Ok(found)
    }
}

#[async_trait]
impl SourceAdapter for NoFluffJobsAdapter {
    fn source_id(&self) -> &'static str {
        NOFLUFFJOBS_SOURCE_ID
    }

    async fn discover_listings(
        &self,
        pages: &dyn PageSource,
        config: &DiscoveryConfig,
    ) -> Result<Vec<ListingTarget>, AdapterError> {
        let mut categories = Vec::new();
        if config.auto_discover {
            categories = self.discover_categories(pages, config).await?;
            if categories.is_empty() {
                info!("category auto-discovery found nothing; using static category list");
            } else {
                info!(count = categories.len(), "discovered categories from navigation");
            }
        }
        if categories.is_empty() {
            categories = config.categories.clone();
        }
        Ok(listing_targets(config, &categories))
    }

    fn parse_listing(&self, markup: &str) -> Result<Vec<String>, AdapterError> {
        extract_posting_links(markup)
    }

    fn parse_detail(&self, markup: &str, url: &str) -> Result<Option<PostingDraft>, AdapterError> {
        parse_posting(markup, url, NOFLUFFJOBS_SOURCE_ID)
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css}: {e}")))
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of an HTML fragment. Entity-escaped markup is unwrapped once more.
pub(crate) fn html_to_text(fragment: &str) -> String {
    let text = fragment_text(fragment);
    if TAG_LIKE.is_match(&text) {
        fragment_text(&text)
    } else {
        text
    }
}

fn fragment_text(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    collapse_whitespace(&parsed.root_element().text().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobharvest_storage::{FetchFailureReason, FetchOutcome, FetchedPage};
    use std::collections::HashMap;

    struct MapPages(HashMap<String, String>);

    #[async_trait]
    impl PageSource for MapPages {
        async fn fetch_page(&self, url: &str) -> FetchOutcome {
            match self.0.get(url) {
                Some(body) => FetchOutcome::Fetched(FetchedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    body: body.clone(),
                    fetched_at: chrono::Utc::now(),
                }),
                None => FetchOutcome::failed(url, FetchFailureReason::HttpStatus(404)),
            }
        }
    }

    fn config(auto_discover: bool) -> DiscoveryConfig {
        DiscoveryConfig {
            country: "pl".into(),
            categories: vec!["backend".into()],
            auto_discover,
            include_remote: false,
            include_uncategorized: false,
            page_depth: 1,
        }
    }

    #[tokio::test]
    async fn failed_auto_discovery_falls_back_to_static_categories() {
        let pages = MapPages(HashMap::new());
        let targets = NoFluffJobsAdapter::new()
            .discover_listings(&pages, &config(true))
            .await
            .unwrap();
        let urls = targets.iter().map(|t| t.url.as_str()).collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://nofluffjobs.com/pl/backend"]);
    }

    #[tokio::test]
    async fn auto_discovery_uses_navigation_slugs() {
        let nav = r#"<nav>
            <a href="/pl/data">Data</a>
            <a href="/pl/devops">DevOps</a>
            <a href="/pl/job/some-offer-abc">offer</a>
            <a href="/pl/data">Data again</a>
        </nav>"#;
        let remote_nav = r#"<a href="/pl/remote/testing">Testing</a>"#;
        let pages = MapPages(HashMap::from([
            ("https://nofluffjobs.com/pl".to_string(), nav.to_string()),
            ("https://nofluffjobs.com/pl/remote".to_string(), remote_nav.to_string()),
        ]));
        let targets = NoFluffJobsAdapter::new()
            .discover_listings(&pages, &config(true))
            .await
            .unwrap();
        let categories = targets
            .iter()
            .filter_map(|t| t.category.clone())
            .collect::<Vec<_>>();
        assert_eq!(categories, vec!["data", "devops", "testing"]);
    }

    #[test]
    fn html_to_text_unwraps_escaped_markup() {
        assert_eq!(html_to_text("<p>Python &amp; SQL</p>"), "Python & SQL");
        assert_eq!(
            html_to_text("&lt;p&gt;Praca &lt;b&gt;zdalnie&lt;/b&gt;&lt;/p&gt;"),
            "Praca zdalnie"
        );
    }
}
