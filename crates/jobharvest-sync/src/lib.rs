//! Harvest pipeline: configuration, enrichment and the run orchestrator.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use jobharvest_core::{dedup_first_seen, JobPosting, PostingDraft, PostingError, Seniority};
use jobharvest_storage::{HttpFetcher, JobStore};
use serde::Serialize;

mod config;
mod enrich;
mod pipeline;

pub use config::{HarvestConfig, DEFAULT_DATABASE_URL};
pub use enrich::{classify_seniority, PostingEnrichmentHook, SkillDictionary, DEFAULT_SKILLS};
pub use pipeline::{HarvestFailed, HarvestPhase, HarvestSummary, SyncPipeline};

pub const CRATE_NAME: &str = "jobharvest-sync";

/// A fetched draft on its way to storage.
#[derive(Debug, Clone, Serialize)]
pub struct StagedPosting {
    pub draft: PostingDraft,
    pub seniority: Seniority,
    pub skills: Vec<String>,
}

impl StagedPosting {
    pub fn new(draft: PostingDraft) -> Self {
        Self {
            draft,
            seniority: Seniority::default(),
            skills: Vec::new(),
        }
    }

    pub fn into_posting(self, harvest_date: NaiveDate) -> Result<JobPosting, PostingError> {
        JobPosting::from_draft(self.draft, self.seniority, self.skills, harvest_date)
    }
}

pub trait DedupHook: Send + Sync {
    fn apply(&self, items: Vec<StagedPosting>) -> Result<Vec<StagedPosting>>;
}

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, items: Vec<StagedPosting>) -> Result<Vec<StagedPosting>>;
}

/// Keeps the first posting seen for every id.
#[derive(Default)]
pub struct FirstSeenDedupHook;

impl DedupHook for FirstSeenDedupHook {
    fn apply(&self, items: Vec<StagedPosting>) -> Result<Vec<StagedPosting>> {
        Ok(dedup_first_seen(items, |item| item.draft.id().to_string()))
    }
}

/// One harvest with everything taken from the environment.
pub async fn run_harvest_from_env<F>(shutdown: F) -> Result<HarvestSummary>
where
    F: Future<Output = ()> + Send,
{
    let config = HarvestConfig::from_env();
    let store = JobStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let skills = SkillDictionary::load_or_default(&config.skills_file)?;
    let http = HttpFetcher::new(config.http.clone())?;

    let pipeline = SyncPipeline::new(config, Arc::new(http), store).with_hooks(
        Box::new(FirstSeenDedupHook),
        Box::new(PostingEnrichmentHook::new(skills)),
    );
    pipeline.run(shutdown).await
}
