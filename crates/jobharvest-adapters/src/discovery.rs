use std::collections::HashSet;

use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};

use crate::{selector, AdapterError, ListingTarget, NOFLUFFJOBS_ORIGIN};

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "backend",
    "frontend",
    "fullstack",
    "mobile",
    "testing",
    "devops",
    "embedded",
    "security",
    "gaming",
    "artificial-intelligence",
    "big-data",
    "support",
    "it-administrator",
    "agile",
    "product-management",
    "project-manager",
    "business-intelligence",
    "business-analyst",
    "ux",
    "erp",
    "sales",
    "hr",
    "marketing",
    "other",
];

// Path segments that look like slugs but are not listing categories.
const RESERVED_SLUGS: &[&str] = &[
    "job", "jobs", "remote", "company", "companies", "login", "register", "account", "blog",
    "about", "contact", "faq", "privacy", "terms", "cookies", "pricing", "employers", "search",
    "assets", "api", "en", "pl", "cz", "sk", "hu", "de", "nl", "ua",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub country: String,
    pub categories: Vec<String>,
    pub auto_discover: bool,
    pub include_remote: bool,
    pub include_uncategorized: bool,
    pub page_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            country: "pl".to_string(),
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            auto_discover: true,
            include_remote: true,
            include_uncategorized: true,
            page_depth: 3,
        }
    }
}

pub(crate) fn navigation_roots(country: &str) -> [String; 2] {
    [
        format!("{NOFLUFFJOBS_ORIGIN}/{country}"),
        format!("{NOFLUFFJOBS_ORIGIN}/{country}/remote"),
    ]
}

/// Category slugs linked from a navigation page, first-seen order.
pub(crate) fn category_slugs(markup: &str, country: &str) -> Result<Vec<String>, AdapterError> {
    let pattern = Regex::new(&format!(
        r"^/(?:{}/)?(?:remote/)?([a-z0-9]+(?:-[a-z0-9]+)*)/?$",
        regex::escape(country)
    ))?;
    let document = Html::parse_document(markup);
    let links = selector("a[href], [routerlink]")?;

    let mut seen = HashSet::new();
    let mut slugs = Vec::new();
    for element in document.select(&links) {
        let value = element.value();
        let Some(href) = value.attr("href").or_else(|| value.attr("routerlink")) else {
            continue;
        };
        let path = href.strip_prefix(NOFLUFFJOBS_ORIGIN).unwrap_or(href);
        let Some(slug) = pattern.captures(path).and_then(|c| c.get(1)) else {
            continue;
        };
        let slug = slug.as_str();
        if slug == country || RESERVED_SLUGS.contains(&slug) {
            continue;
        }
        if seen.insert(slug.to_string()) {
            slugs.push(slug.to_string());
        }
    }
    Ok(slugs)
}

/// Expand categories into paginated listing URLs.
pub fn listing_targets(config: &DiscoveryConfig, categories: &[String]) -> Vec<ListingTarget> {
    let depth = config.page_depth.max(1);
    let country = config.country.as_str();
    let mut bases: Vec<(String, Option<String>, bool)> = Vec::new();

    for category in categories {
        bases.push((
            format!("{NOFLUFFJOBS_ORIGIN}/{country}/{category}"),
            Some(category.clone()),
            false,
        ));
        if config.include_remote {
            bases.push((
                format!("{NOFLUFFJOBS_ORIGIN}/{country}/remote/{category}"),
                Some(category.clone()),
                true,
            ));
        }
    }
    if config.include_uncategorized {
        bases.push((format!("{NOFLUFFJOBS_ORIGIN}/{country}"), None, false));
        if config.include_remote {
            bases.push((format!("{NOFLUFFJOBS_ORIGIN}/{country}/remote"), None, true));
        }
    }

    let mut targets = Vec::with_capacity(bases.len() * depth);
    for (base, category, remote) in bases {
        for page in 1..=depth {
            let url = if page == 1 {
                base.clone()
            } else {
                format!("{base}?page={page}")
            };
            targets.push(ListingTarget {
                url,
                category: category.clone(),
                remote,
                page,
            });
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_paginate_and_add_remote_variants() {
        let config = DiscoveryConfig {
            page_depth: 2,
            include_uncategorized: false,
            ..DiscoveryConfig::default()
        };
        let targets = listing_targets(&config, &["backend".to_string()]);
        let urls = targets.iter().map(|t| t.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec![
                "https://nofluffjobs.com/pl/backend",
                "https://nofluffjobs.com/pl/backend?page=2",
                "https://nofluffjobs.com/pl/remote/backend",
                "https://nofluffjobs.com/pl/remote/backend?page=2",
            ]
        );
        assert!(targets[2].remote);
        assert_eq!(targets[3].page, 2);
    }

    #[test]
    fn uncategorized_roots_are_optional() {
        let config = DiscoveryConfig {
            page_depth: 1,
            include_remote: false,
            ..DiscoveryConfig::default()
        };
        let targets = listing_targets(&config, &[]);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].url, "https://nofluffjobs.com/pl");
        assert_eq!(targets[0].category, None);
    }

    #[test]
    fn zero_depth_still_scans_first_page() {
        let config = DiscoveryConfig {
            page_depth: 0,
            include_remote: false,
            include_uncategorized: false,
            ..DiscoveryConfig::default()
        };
        assert_eq!(listing_targets(&config, &["ux".to_string()]).len(), 1);
    }

    #[test]
    fn slugs_skip_reserved_and_posting_paths() {
        let markup = r#"
            <a href="/pl/backend">Backend</a>
            <a href="https://nofluffjobs.com/pl/big-data/">Big data</a>
            <a href="/pl/job/python-dev-acme-warszawa">offer</a>
            <a href="/pl/remote">Remote</a>
            <a href="/blog">Blog</a>
            <span routerlink="/pl/remote/ux">UX</span>
            <a href="/pl/backend">dup</a>
        "#;
        let slugs = category_slugs(markup, "pl").unwrap();
        assert_eq!(slugs, vec!["backend", "big-data", "ux"]);
    }
}
