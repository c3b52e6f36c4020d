use chrono::{DateTime, NaiveDate};
use jobharvest_core::{FieldOrigin, PostingDraft, LOCATION_REMOTE, LOCATION_UNSPECIFIED};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::Html;
use serde_json::Value;
use tracing::debug;

use crate::{collapse_whitespace, html_to_text, selector, AdapterError};

/// Lowercase phrases that mark remote or hybrid work, Polish and English.
pub const REMOTE_HINTS: &[&str] = &[
    "zdalnie",
    "zdalna",
    "zdalny",
    "praca zdalna",
    "remote",
    "hybrid",
    "hybrydowo",
    "hybrydowa",
    "home office",
];

lazy_static! {
    static ref TITLE_SITE_SUFFIX: Regex = Regex::new(
        r"(?i)(?:^|\s*[|\-–—]\s*)(?:no\s*fluff\s*jobs|nofluffjobs(?:\.com)?)\b.*$"
    ).unwrap();

    // Loose patterns for values the structured block did not carry.
    static ref LOOSE_COMPANY: Regex = Regex::new(
        r#"(?s)"(?:hiringOrganization"\s*:\s*\{[^{}]*?"name|companyName)"\s*:\s*"([^"]+)""#
    ).unwrap();
    static ref LOOSE_LOCALITY: Regex = Regex::new(r#""addressLocality"\s*:\s*"([^"]+)""#).unwrap();
    static ref LOOSE_SENIORITY: Regex = Regex::new(r#""seniority"\s*:\s*\[?\s*"([^"]+)""#).unwrap();
}

/// Extract one posting page into a draft.
///
/// Structured data is read first; fallbacks only fill what it left empty.
pub fn parse_posting(markup: &str, url: &str, source: &str) -> Result<Option<PostingDraft>, AdapterError> {
    let document = Html::parse_document(markup);
    let mut draft = PostingDraft::new(url, source);

    match job_posting_block(&document)? {
        Some(block) => apply_structured(&mut draft, &block),
        None => debug!(url, "no JobPosting structured data block"),
    }

    apply_markup_fallbacks(&mut draft, &document, markup)?;

    if !draft.location.is_present() {
        let haystack = format!("{} {} {}", draft.title_text(), draft.description_text(), markup).to_lowercase();
        if REMOTE_HINTS.iter().any(|hint| haystack.contains(hint)) {
            draft.location.fill_text(Some(LOCATION_REMOTE.to_string()), FieldOrigin::TextHint);
        } else {
            draft.location.fill_text(Some(LOCATION_UNSPECIFIED.to_string()), FieldOrigin::Default);
        }
    }

    if !draft.title.is_present() {
        debug!(url, "posting rejected: no title");
        return Ok(None);
    }
    Ok(Some(draft))
}

fn job_posting_block(document: &Html) -> Result<Option<Value>, AdapterError> {
    let scripts = selector(r#"script[type="application/ld+json"]"#)?;
    for script in document.select(&scripts) {
        let raw = script.text().collect::<String>();
        let Ok(parsed) = serde_json::from_str::<Value>(raw.trim()) else {
            debug!("skipping malformed ld+json block");
            continue;
        };
        let mut candidates = Vec::new();
        flatten_candidates(parsed, &mut candidates);
        if let Some(found) = candidates.into_iter().find(is_job_posting) {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn flatten_candidates(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.into_iter().for_each(|item| flatten_candidates(item, out)),
        Value::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                flatten_candidates(graph, out);
            }
            if !map.is_empty() {
                out.push(Value::Object(map));
            }
        }
        _ => {}
    }
}

fn is_job_posting(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(kind)) => kind == "JobPosting",
        Some(Value::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("JobPosting")),
        _ => false,
    }
}

fn apply_structured(draft: &mut PostingDraft, block: &Value) {
    let origin = FieldOrigin::StructuredData;

    draft.title.fill_text(string_at(block, "title").map(|t| collapse_whitespace(&t)), origin);

    let company = match block.get("hiringOrganization") {
        Some(Value::String(name)) => Some(name.clone()),
        Some(org) => string_at(org, "name"),
        None => None,
    };
    draft.company.fill_text(company, origin);

    draft.location.fill_text(block.get("jobLocation").and_then(location_text), origin);
    if !draft.location.is_present() && is_telecommute(block) {
        draft.location.fill_text(Some(LOCATION_REMOTE.to_string()), origin);
    }

    draft
        .description
        .fill_text(string_at(block, "description").map(|d| html_to_text(&d)), origin);

    let posted = string_at(block, "datePosted")
        .or_else(|| string_at(block, "validFrom"))
        .and_then(|raw| normalize_date(&raw));
    draft.posted_at.fill_text(posted, origin);

    let hint = block
        .get("experienceRequirements")
        .and_then(experience_text)
        .or_else(|| string_at(block, "seniority"));
    draft.seniority_hint.fill_text(hint, origin);
}

fn apply_markup_fallbacks(draft: &mut PostingDraft, document: &Html, markup: &str) -> Result<(), AdapterError> {
    let origin = FieldOrigin::MarkupFallback;

    draft.company.fill_text(first_capture(&LOOSE_COMPANY, markup), origin);

    if !draft.title.is_present() {
        let title_sel = selector("title")?;
        let title = document
            .select(&title_sel)
            .next()
            .map(|t| collapse_whitespace(&t.text().collect::<String>()))
            .map(|t| clean_page_title(&t, draft.company.as_str()));
        draft.title.fill_text(title, origin);
    }

    draft.location.fill_text(first_capture(&LOOSE_LOCALITY, markup), origin);
    draft.seniority_hint.fill_text(first_capture(&LOOSE_SENIORITY, markup), origin);
    Ok(())
}

/// Page `<title>` minus the site branding and trailing segments naming the company.
fn clean_page_title(raw: &str, company: Option<&str>) -> String {
    let stripped = TITLE_SITE_SUFFIX.replace(raw, "");
    let mut segments = stripped
        .split(" | ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    while segments.len() > 1 && segments.last().is_some_and(|seg| names_company(seg, company)) {
        segments.pop();
    }
    segments.join(" | ")
}

// "Beta" names "Beta SA" and the reverse.
fn names_company(segment: &str, company: Option<&str>) -> bool {
    let Some(company) = company else {
        return false;
    };
    let (segment, company) = (segment.to_lowercase(), company.trim().to_lowercase());
    !company.is_empty() && (company.starts_with(&segment) || segment.starts_with(&company))
}

fn first_capture(pattern: &Regex, markup: &str) -> Option<String> {
    pattern
        .captures(markup)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn string_at(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(str::to_string),
        Value::Array(items) => items.iter().find_map(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn location_text(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.iter().find_map(location_text),
        Value::Object(_) => {
            let address = value.get("address").unwrap_or(value);
            ["addressLocality", "addressRegion", "addressCountry"]
                .into_iter()
                .find_map(|key| string_at(address, key).and_then(jobharvest_core::non_empty))
        }
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn is_telecommute(block: &Value) -> bool {
    match block.get("jobLocationType") {
        Some(Value::String(kind)) => kind.eq_ignore_ascii_case("TELECOMMUTE"),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .any(|k| k.eq_ignore_ascii_case("TELECOMMUTE")),
        _ => false,
    }
}

fn experience_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(experience_text),
        Value::Object(_) => string_at(value, "name")
            .or_else(|| string_at(value, "description"))
            .or_else(|| string_at(value, "experienceLevel")),
        _ => None,
    }
}

/// `YYYY-MM-DD` when the value starts with a parseable date, otherwise the value as given.
fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive().format("%Y-%m-%d").to_string());
    }
    let head = raw.get(..10).unwrap_or(raw);
    match NaiveDate::parse_from_str(head, "%Y-%m-%d") {
        Ok(date) => Some(date.format("%Y-%m-%d").to_string()),
        Err(_) => Some(raw.to_string()),
    }
}
