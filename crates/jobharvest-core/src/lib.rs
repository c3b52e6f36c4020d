//! Core domain model for harvested job postings.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobharvest-core";

/// Location sentinel for postings that advertise remote or hybrid work.
pub const LOCATION_REMOTE: &str = "remote";
/// Location sentinel when nothing about the place of work is recoverable.
pub const LOCATION_UNSPECIFIED: &str = "unspecified";

/// Where an extracted value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    StructuredData,
    MarkupFallback,
    TextHint,
    Default,
}

/// Extracted value with optional provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub origin: Option<FieldOrigin>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            origin: None,
        }
    }

    pub fn with_origin(value: T, origin: FieldOrigin) -> Self {
        Self {
            value: Some(value),
            origin: Some(origin),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    /// Fill the field only when it is still empty.
    pub fn fill(&mut self, value: Option<T>, origin: FieldOrigin) {
        if self.value.is_none() {
            if let Some(value) = value {
                self.value = Some(value);
                self.origin = Some(origin);
            }
        }
    }
}

impl Field<String> {
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Like [`Field::fill`] but treats whitespace-only text as absent.
    pub fn fill_text(&mut self, value: Option<String>, origin: FieldOrigin) {
        self.fill(value.and_then(non_empty), origin);
    }
}

/// Trim and drop empty strings.
pub fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Seniority {
    Junior,
    #[default]
    Mid,
    Senior,
}

impl Seniority {
    pub const ALL: [Seniority; 3] = [Seniority::Junior, Seniority::Mid, Seniority::Senior];

    pub fn as_str(self) -> &'static str {
        match self {
            Seniority::Junior => "Junior",
            Seniority::Mid => "Mid",
            Seniority::Senior => "Senior",
        }
    }
}

impl fmt::Display for Seniority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown seniority level: {0}")]
pub struct UnknownSeniority(pub String);

impl FromStr for Seniority {
    type Err = UnknownSeniority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Seniority::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSeniority(s.to_string()))
    }
}

/// Best-effort extraction result for one posting page, before enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingDraft {
    /// Canonical posting URL; doubles as the record id.
    pub url: String,
    pub source: String,
    pub title: Field<String>,
    pub company: Field<String>,
    pub location: Field<String>,
    pub description: Field<String>,
    pub posted_at: Field<String>,
    pub seniority_hint: Field<String>,
}

impl PostingDraft {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            title: Field::empty(),
            company: Field::empty(),
            location: Field::empty(),
            description: Field::empty(),
            posted_at: Field::empty(),
            seniority_hint: Field::empty(),
        }
    }

    pub fn id(&self) -> &str {
        &self.url
    }

    pub fn title_text(&self) -> &str {
        self.title.as_str().unwrap_or_default()
    }

    pub fn description_text(&self) -> &str {
        self.description.as_str().unwrap_or_default()
    }
}

/// Enriched, persistable posting. One row in both the raw and clean tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub source: String,
    pub posted_at: String,
    pub url: String,
    pub skills: Vec<String>,
    pub seniority: Seniority,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostingError {
    #[error("posting {0} has no title")]
    MissingTitle(String),
    #[error("posting has an empty id")]
    MissingId,
}

impl JobPosting {
    /// Build a persistable record. `harvest_date` fills a missing posting date.
    pub fn from_draft(
        draft: PostingDraft,
        seniority: Seniority,
        mut skills: Vec<String>,
        harvest_date: NaiveDate,
    ) -> Result<Self, PostingError> {
        if draft.url.trim().is_empty() {
            return Err(PostingError::MissingId);
        }
        let title = draft
            .title
            .value
            .and_then(non_empty)
            .ok_or_else(|| PostingError::MissingTitle(draft.url.clone()))?;

        skills.sort();
        skills.dedup();

        Ok(Self {
            id: draft.url.clone(),
            title,
            company: draft.company.value.unwrap_or_default(),
            location: draft
                .location
                .value
                .and_then(non_empty)
                .unwrap_or_else(|| LOCATION_UNSPECIFIED.to_string()),
            description: draft.description.value.unwrap_or_default(),
            source: draft.source,
            posted_at: draft
                .posted_at
                .value
                .and_then(non_empty)
                .unwrap_or_else(|| harvest_date.format("%Y-%m-%d").to_string()),
            url: draft.url,
            skills,
            seniority,
        })
    }

    /// Storage form of the skill list: sorted, comma-joined.
    pub fn skills_joined(&self) -> String {
        self.skills.join(",")
    }
}

/// Keep the first record for every distinct key, preserving input order.
pub fn dedup_first_seen<T, K, F>(items: impl IntoIterator<Item = T>, mut key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}
