//! Seniority classification and skill extraction.

use std::path::Path;

use anyhow::{bail, Context, Result};
use jobharvest_core::Seniority;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::{EnrichmentHook, StagedPosting};

/// Built-in skill dictionary, used when no rules file is present.
pub const DEFAULT_SKILLS: &[&str] = &[
    "python",
    "sql",
    "pandas",
    "numpy",
    "scikit-learn",
    "tensorflow",
    "pytorch",
    "aws",
    "gcp",
    "azure",
    "docker",
    "kubernetes",
    "dbt",
    "spark",
    "airflow",
    "hadoop",
    "kafka",
    "redshift",
    "snowflake",
    "postgresql",
    "mysql",
    "git",
];

// Hint values that carry no seniority information.
const UNSPECIFIED_HINTS: &[&str] = &[
    "unspecified",
    "not specified",
    "unknown",
    "n/a",
    "na",
    "none",
    "-",
    "brak",
];

lazy_static! {
    static ref JUNIOR_WORDS: Regex = Regex::new(r"(?i)\b(?:junior|intern|trainee|student|jr)\b").unwrap();
    static ref SENIOR_WORDS: Regex =
        Regex::new(r"(?i)\b(?:senior|lead|principal|staff|expert|architect|sr)\b").unwrap();
    static ref MID_WORDS: Regex = Regex::new(r"(?i)\b(?:mid|middle|regular)\b").unwrap();

    // Free-text scan, checked in this order.
    static ref TEXT_LEVELS: Vec<(Regex, Seniority)> = vec![
        (Regex::new(r"(?i)\bsenior\b|\bsr\.").unwrap(), Seniority::Senior),
        (Regex::new(r"(?i)\b(?:mid|regular)\b").unwrap(), Seniority::Mid),
        (Regex::new(r"(?i)\b(?:junior|entry)\b").unwrap(), Seniority::Junior),
    ];
}

fn synonym_level(text: &str) -> Option<Seniority> {
    if JUNIOR_WORDS.is_match(text) {
        Some(Seniority::Junior)
    } else if SENIOR_WORDS.is_match(text) {
        Some(Seniority::Senior)
    } else if MID_WORDS.is_match(text) {
        Some(Seniority::Mid)
    } else {
        None
    }
}

/// Map a posting to a seniority level.
///
/// An absent hint means "no information" and yields `Mid` right away. A
/// present but unrecognised hint falls through to the title, then to a
/// keyword scan over title and description, then to `Mid`.
pub fn classify_seniority(hint: Option<&str>, title: &str, description: &str) -> Seniority {
    let Some(hint) = hint else {
        return Seniority::Mid;
    };
    let hint = hint.trim();
    if hint.is_empty() || UNSPECIFIED_HINTS.iter().any(|s| hint.eq_ignore_ascii_case(s)) {
        return Seniority::Mid;
    }
    if let Some(level) = synonym_level(hint) {
        return level;
    }
    if let Some(level) = synonym_level(title) {
        return level;
    }
    let text = format!("{title} {description}");
    TEXT_LEVELS
        .iter()
        .find(|(pattern, _)| pattern.is_match(&text))
        .map(|(_, level)| *level)
        .unwrap_or_default()
}

const SKILLS_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct SkillsFile {
    version: u32,
    #[serde(default)]
    skills: Vec<String>,
}

/// Case-insensitive substring lookup over a fixed term list.
#[derive(Debug, Clone)]
pub struct SkillDictionary {
    terms: Vec<String>,
}

impl Default for SkillDictionary {
    fn default() -> Self {
        Self::new(DEFAULT_SKILLS.iter().map(|s| s.to_string()))
    }
}

impl SkillDictionary {
    pub fn new(terms: impl IntoIterator<Item = String>) -> Self {
        let mut terms = terms
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        terms.sort();
        terms.dedup();
        Self { terms }
    }

    /// Load `skills:` from a YAML file; a missing file means the built-in list.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "skills file not found; using built-in dictionary");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: SkillsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if file.version != SKILLS_FILE_VERSION {
            bail!(
                "{}: unsupported skills file version {} (expected {SKILLS_FILE_VERSION})",
                path.display(),
                file.version
            );
        }
        Ok(Self::new(file.skills))
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Sorted, unique dictionary terms contained in `text`.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        self.terms
            .iter()
            .filter(|term| haystack.contains(term.as_str()))
            .cloned()
            .collect()
    }
}

/// Fills seniority and skills on staged postings.
pub struct PostingEnrichmentHook {
    skills: SkillDictionary,
}

impl PostingEnrichmentHook {
    pub fn new(skills: SkillDictionary) -> Self {
        Self { skills }
    }
}

impl EnrichmentHook for PostingEnrichmentHook {
    fn apply(&self, mut items: Vec<StagedPosting>) -> Result<Vec<StagedPosting>> {
        for item in &mut items {
            let title = item.draft.title_text();
            let description = item.draft.description_text();
            item.seniority = classify_seniority(item.draft.seniority_hint.as_str(), title, description);
            item.skills = self.skills.extract(&format!("{title} {description}"));
        }
        Ok(items)
    }
}
