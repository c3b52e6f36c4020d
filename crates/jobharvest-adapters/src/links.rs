use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use scraper::Html;

use crate::{selector, AdapterError, ORIGIN_URL};

const ALTERNATE_ATTRS: &[&str] = &["data-href", "data-url", "data-link", "routerlink"];

lazy_static! {
    static ref POSTING_PATH: Regex = Regex::new(r"^/(?:[a-z]{2}/)?job/[^/?#\s]+/?$").unwrap();

    // Absolute posting URLs inside scripts or inline state.
    static ref EMBEDDED_POSTING_URL: Regex = Regex::new(
        r#"https?://(?:www\.)?nofluffjobs\.com/(?:[a-z]{2}/)?job/[^\s"'<>\\?#]+"#
    ).unwrap();
}

/// Canonical absolute form of a posting link, or `None` if it is not one.
///
/// Relative links resolve against the site origin. Query, fragment and any
/// trailing slash are dropped so the result can serve as a record id.
pub fn canonical_posting_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = ORIGIN_URL.join(raw).ok()?;
    let host = url.host_str()?.trim_start_matches("www.");
    if host != "nofluffjobs.com" {
        return None;
    }
    if !POSTING_PATH.is_match(url.path()) {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    let _ = url.set_host(Some("nofluffjobs.com"));
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    Some(url.to_string())
}

/// Posting URLs found on a listing page.
///
/// Anchors come first, then alternate link attributes, then absolute URLs
/// embedded anywhere in the text (inline state blobs, scripts).
pub fn extract_posting_links(markup: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(markup);
    let mut candidates: Vec<String> = Vec::new();

    let anchors = selector("a[href]")?;
    candidates.extend(
        document
            .select(&anchors)
            .filter_map(|a| a.value().attr("href"))
            .map(str::to_string),
    );

    for attr in ALTERNATE_ATTRS {
        let sel = selector(&format!("[{attr}]"))?;
        candidates.extend(
            document
                .select(&sel)
                .filter_map(|el| el.value().attr(attr))
                .map(str::to_string),
        );
    }

    let unescaped = markup.replace("\\/", "/");
    candidates.extend(
        EMBEDDED_POSTING_URL
            .find_iter(&unescaped)
            .map(|m| m.as_str().to_string()),
    );

    let mut seen = HashSet::new();
    Ok(candidates
        .iter()
        .filter_map(|raw| canonical_posting_url(raw))
        .filter(|url| seen.insert(url.clone()))
        .collect())
}
