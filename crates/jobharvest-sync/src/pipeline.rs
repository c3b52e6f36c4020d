use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use jobharvest_adapters::{NoFluffJobsAdapter, SourceAdapter};
use jobharvest_core::{dedup_first_seen, JobPosting, PostingDraft};
use jobharvest_storage::{
    DumpStore, FetchFailure, FetchOutcome, JobStore, PageSource, StoreMetrics, UpsertPolicy, UpsertReport,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::enrich::{PostingEnrichmentHook, SkillDictionary};
use crate::{DedupHook, EnrichmentHook, FirstSeenDedupHook, HarvestConfig, StagedPosting};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarvestPhase {
    Idle,
    Discovering,
    Fetching,
    Enriching,
    Flushing,
    Failed,
}

impl fmt::Display for HarvestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listing_pages: usize,
    pub listing_failures: usize,
    pub discovered_postings: usize,
    pub skipped_existing: usize,
    pub queued: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub extracted: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub batches: usize,
    /// Batch upserts that failed and were attempted again.
    pub flush_retries: usize,
    pub interrupted: bool,
    pub phase: HarvestPhase,
    pub metrics: StoreMetrics,
}

impl HarvestSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            listing_pages: 0,
            listing_failures: 0,
            discovered_postings: 0,
            skipped_existing: 0,
            queued: 0,
            fetched: 0,
            fetch_failures: 0,
            extracted: 0,
            rejected: 0,
            inserted: 0,
            updated: 0,
            batches: 0,
            flush_retries: 0,
            interrupted: false,
            phase: HarvestPhase::Idle,
            metrics: StoreMetrics::default(),
        }
    }

    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }

    fn enter(&mut self, next: HarvestPhase) {
        if self.phase != next {
            info!(from = %self.phase, to = %next, "harvest phase");
            self.phase = next;
        }
    }
}

/// Context on the error of a run that could not finish; carries the counts reached so far.
#[derive(Debug, Clone)]
pub struct HarvestFailed {
    pub summary: HarvestSummary,
}

impl fmt::Display for HarvestFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.summary;
        write!(
            f,
            "harvest {} failed: discovered={} fetched={} failed={} skipped={} persisted={} batches={}",
            s.run_id,
            s.discovered_postings,
            s.fetched,
            s.fetch_failures,
            s.skipped_existing,
            s.persisted(),
            s.batches
        )
    }
}

/// What a worker reports for one posting URL.
enum WorkerEvent {
    Extracted(PostingDraft),
    Rejected(String),
    FetchFailed(FetchFailure),
}

pub struct SyncPipeline {
    config: HarvestConfig,
    pages: Arc<dyn PageSource>,
    adapter: Arc<dyn SourceAdapter>,
    store: JobStore,
    dumps: Option<DumpStore>,
    dedup: Box<dyn DedupHook>,
    enrichment: Box<dyn EnrichmentHook>,
}

impl SyncPipeline {
    pub fn new(config: HarvestConfig, pages: Arc<dyn PageSource>, store: JobStore) -> Self {
        let dumps = config
            .raw_dump
            .then(|| DumpStore::new(config.raw_dump_dir.clone()));
        Self {
            config,
            pages,
            adapter: Arc::new(NoFluffJobsAdapter::new()),
            store,
            dumps,
            dedup: Box::<FirstSeenDedupHook>::default(),
            enrichment: Box::new(PostingEnrichmentHook::new(SkillDictionary::default())),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_hooks(mut self, dedup: Box<dyn DedupHook>, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.dedup = dedup;
        self.enrichment = enrichment;
        self
    }

    /// Run one harvest. `shutdown` resolving stops fetching and flushes what is buffered.
    ///
    /// Only a batch that cannot be persisted after retries ends the run with an error.
    pub async fn run<F>(&self, shutdown: F) -> Result<HarvestSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("harvest_run", %run_id, source = self.adapter.source_id());
        self.run_inner(run_id, started_at, shutdown).instrument(span).await
    }

    async fn run_inner<F>(&self, run_id: Uuid, started_at: DateTime<Utc>, shutdown: F) -> Result<HarvestSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let mut summary = HarvestSummary::new(run_id, started_at);
        let outcome = self.execute(&mut summary, shutdown).await;
        summary.finished_at = Utc::now();

        if let Err(err) = outcome {
            summary.enter(HarvestPhase::Failed);
            if let Ok(metrics) = self.store.metrics().await {
                summary.metrics = metrics;
            }
            error!(
                error = %format!("{err:#}"),
                discovered = summary.discovered_postings,
                fetched = summary.fetched,
                failed = summary.fetch_failures,
                skipped = summary.skipped_existing,
                persisted = summary.persisted(),
                batches = summary.batches,
                "harvest failed"
            );
            return Err(err.context(HarvestFailed { summary }));
        }

        summary.enter(HarvestPhase::Idle);
        info!(
            discovered = summary.discovered_postings,
            fetched = summary.fetched,
            extracted = summary.extracted,
            rejected = summary.rejected,
            failed = summary.fetch_failures,
            skipped = summary.skipped_existing,
            persisted = summary.persisted(),
            interrupted = summary.interrupted,
            total_rows = summary.metrics.clean_rows,
            companies = summary.metrics.distinct_companies,
            "harvest finished"
        );
        Ok(summary)
    }

    async fn execute<F>(&self, summary: &mut HarvestSummary, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let harvest_date = summary.started_at.date_naive();
        tokio::pin!(shutdown);

        summary.enter(HarvestPhase::Discovering);
        let queue = match self.discover(summary, &mut shutdown).await? {
            Some(queue) => queue,
            None => {
                summary.interrupted = true;
                Vec::new()
            }
        };

        let mut buffer = Vec::new();
        if !queue.is_empty() {
            summary.enter(HarvestPhase::Fetching);
            self.fetch_all(queue, summary, &mut buffer, harvest_date, &mut shutdown)
                .await?;
        }

        if !buffer.is_empty() {
            self.flush(std::mem::take(&mut buffer), harvest_date, summary)
                .await?;
        }

        summary.metrics = self.store.metrics().await.context("reading store metrics")?;
        Ok(())
    }

    /// Posting URLs to fetch, or `None` when interrupted before discovery finished.
    async fn discover<S>(&self, summary: &mut HarvestSummary, shutdown: &mut S) -> Result<Option<Vec<String>>>
    where
        S: Future<Output = ()> + Unpin,
    {
        let listings = self
            .adapter
            .discover_listings(self.pages.as_ref(), &self.config.discovery)
            .await
            .context("enumerating listing pages")?;
        summary.listing_pages = listings.len();
        info!(listings = listings.len(), "listing pages to scan");

        let mut found = Vec::new();
        for listing in &listings {
            let outcome = tokio::select! {
                biased;
                _ = &mut *shutdown => {
                    warn!("interrupted during discovery");
                    return Ok(None);
                }
                outcome = self.pages.fetch_page(&listing.url) => outcome,
            };
            let Some(markup) = outcome.into_body() else {
                summary.listing_failures += 1;
                continue;
            };
            match self.adapter.parse_listing(&markup) {
                Ok(links) => {
                    debug!(url = %listing.url, links = links.len(), "listing parsed");
                    found.extend(links);
                }
                Err(err) => {
                    summary.listing_failures += 1;
                    warn!(url = %listing.url, error = %err, "listing parse failed");
                }
            }
        }

        let mut queue = dedup_first_seen(found, |url| url.clone());
        summary.discovered_postings = queue.len();
        if queue.is_empty() {
            warn!("discovery found no posting urls");
            return Ok(Some(queue));
        }

        if self.config.skip_existing {
            let existing = self.store.existing_ids().await.context("loading persisted ids")?;
            let before = queue.len();
            queue.retain(|url| !existing.contains(url));
            summary.skipped_existing = before - queue.len();
        }
        if self.config.max_postings > 0 && queue.len() > self.config.max_postings {
            info!(cap = self.config.max_postings, found = queue.len(), "posting cap applied");
            queue.truncate(self.config.max_postings);
        }
        summary.queued = queue.len();
        info!(
            discovered = summary.discovered_postings,
            skipped = summary.skipped_existing,
            queued = summary.queued,
            "discovery done"
        );
        Ok(Some(queue))
    }

    async fn fetch_all<S>(
        &self,
        queue: Vec<String>,
        summary: &mut HarvestSummary,
        buffer: &mut Vec<PostingDraft>,
        harvest_date: NaiveDate,
        shutdown: &mut S,
    ) -> Result<()>
    where
        S: Future<Output = ()> + Unpin,
    {
        let queue = Arc::new(Mutex::new(queue.into_iter()));
        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(self.config.batch_size.max(16));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        for worker_id in 0..self.config.workers.max(1) {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let mut stop = stop_rx.clone();
            let pages = Arc::clone(&self.pages);
            let adapter = Arc::clone(&self.adapter);
            workers.spawn(
                async move {
                    loop {
                        if *stop.borrow() {
                            break;
                        }
                        let next = queue.lock().await.next();
                        let Some(url) = next else { break };
                        // A finished fetch is always reported; only a pending one is abandoned.
                        let event = tokio::select! {
                            biased;
                            event = fetch_one(pages.as_ref(), adapter.as_ref(), url) => event,
                            _ = stop.changed() => break,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(info_span!("harvest_worker", worker_id)),
            );
        }
        drop(tx);
        drop(stop_rx);

        let mut stopping = false;
        loop {
            let event = if stopping {
                rx.recv().await
            } else {
                tokio::select! {
                    biased;
                    _ = &mut *shutdown => {
                        warn!(buffered = buffer.len(), "interrupted; collecting in-flight postings before the final flush");
                        summary.interrupted = true;
                        stopping = true;
                        let _ = stop_tx.send(true);
                        continue;
                    }
                    event = rx.recv() => event,
                }
            };
            let Some(event) = event else { break };
            record_event(event, summary, buffer);
            if buffer.len() >= self.config.batch_size {
                self.flush(std::mem::take(buffer), harvest_date, summary).await?;
                summary.enter(HarvestPhase::Fetching);
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    warn!(error = %err, "harvest worker panicked");
                }
            }
        }
        Ok(())
    }

    async fn flush(&self, drafts: Vec<PostingDraft>, harvest_date: NaiveDate, summary: &mut HarvestSummary) -> Result<()> {
        let batch_no = summary.batches + 1;
        summary.enter(HarvestPhase::Enriching);

        if let Some(dumps) = &self.dumps {
            match dumps
                .write_jsonl(self.adapter.source_id(), Utc::now(), batch_no, &drafts)
                .await
            {
                Ok(dump) => debug!(path = %dump.path.display(), sha256 = %dump.content_hash, "raw batch dumped"),
                Err(err) => warn!(error = %err, "raw dump failed"),
            }
        }

        let staged = drafts.into_iter().map(StagedPosting::new).collect::<Vec<_>>();
        let staged = self.dedup.apply(staged)?;
        let staged = self.enrichment.apply(staged)?;

        let mut postings: Vec<JobPosting> = Vec::with_capacity(staged.len());
        for item in staged {
            match item.into_posting(harvest_date) {
                Ok(posting) => postings.push(posting),
                Err(err) => {
                    summary.rejected += 1;
                    debug!(error = %err, "posting dropped before persistence");
                }
            }
        }

        summary.enter(HarvestPhase::Flushing);
        let report = self.upsert_with_retries(&postings, summary).await?;
        summary.batches = batch_no;
        summary.inserted += report.inserted;
        summary.updated += report.updated;
        info!(
            batch = batch_no,
            rows = postings.len(),
            inserted = report.inserted,
            updated = report.updated,
            "batch flushed"
        );
        Ok(())
    }

    async fn upsert_with_retries(&self, postings: &[JobPosting], summary: &mut HarvestSummary) -> Result<UpsertReport> {
        let policy = UpsertPolicy {
            keep_first_posted_at: self.config.keep_first_posted_at,
        };
        let backoff = self.config.flush_backoff;
        let mut attempt = 0;
        loop {
            match self.store.upsert_batch(postings, policy).await {
                Ok(report) => return Ok(report),
                Err(err) if attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, error = %err, delay_ms = delay.as_millis() as u64, "batch upsert failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    summary.flush_retries += 1;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!(
                        "persisting batch of {} postings failed after {} attempts",
                        postings.len(),
                        attempt + 1
                    )));
                }
            }
        }
    }
}

async fn fetch_one(pages: &dyn PageSource, adapter: &dyn SourceAdapter, url: String) -> WorkerEvent {
    let page = match pages.fetch_page(&url).await {
        FetchOutcome::Fetched(page) => page,
        FetchOutcome::Failed(failure) => return WorkerEvent::FetchFailed(failure),
    };
    match adapter.parse_detail(&page.body, &url) {
        Ok(Some(draft)) => WorkerEvent::Extracted(draft),
        Ok(None) => WorkerEvent::Rejected(url),
        Err(err) => {
            warn!(url = %url, error = %err, "posting extraction failed");
            WorkerEvent::Rejected(url)
        }
    }
}

fn record_event(event: WorkerEvent, summary: &mut HarvestSummary, buffer: &mut Vec<PostingDraft>) {
    match event {
        WorkerEvent::Extracted(draft) => {
            summary.fetched += 1;
            summary.extracted += 1;
            buffer.push(draft);
        }
        WorkerEvent::Rejected(url) => {
            summary.fetched += 1;
            summary.rejected += 1;
            debug!(url = %url, "posting rejected");
        }
        WorkerEvent::FetchFailed(failure) => {
            summary.fetch_failures += 1;
            debug!(url = %failure.url, reason = ?failure.reason, "posting fetch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobharvest_storage::{FetchFailureReason, FetchedPage};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const BACKEND: &str = "https://nofluffjobs.com/pl/backend";
    const DATA: &str = "https://nofluffjobs.com/pl/data";

    fn job(slug: &str) -> String {
        format!("https://nofluffjobs.com/pl/job/{slug}")
    }

    #[derive(Default)]
    struct FakeSite {
        pages: HashMap<String, String>,
        hang: Option<(String, Arc<Notify>)>,
        // Signals when this url is requested but still serves it.
        trip: Option<(String, Arc<Notify>)>,
        served_postings: Arc<AtomicUsize>,
    }

    impl FakeSite {
        fn page(mut self, url: &str, body: String) -> Self {
            self.pages.insert(url.to_string(), body);
            self
        }

        fn listing(self, url: &str, slugs: &[&str]) -> Self {
            let anchors = slugs
                .iter()
                .map(|s| format!(r#"<a href="/pl/job/{s}">{s}</a>"#))
                .collect::<String>();
            self.page(url, format!("<html><body>{anchors}</body></html>"))
        }

        fn posting(self, slug: &str, title: &str, description: &str, locality: Option<&str>) -> Self {
            let location = locality
                .map(|l| format!(r#","jobLocation":{{"address":{{"addressLocality":"{l}"}}}}"#))
                .unwrap_or_default();
            let body = format!(
                r#"<html><head><script type="application/ld+json">{{"@type":"JobPosting","title":"{title}","hiringOrganization":{{"name":"Acme"}},"description":"{description}","datePosted":"2026-04-01"{location}}}</script></head></html>"#
            );
            self.page(&job(slug), body)
        }
    }

    #[async_trait]
    impl PageSource for FakeSite {
        async fn fetch_page(&self, url: &str) -> FetchOutcome {
            if let Some((hang_url, notify)) = &self.hang {
                if hang_url == url {
                    notify.notify_one();
                    return std::future::pending::<FetchOutcome>().await;
                }
            }
            if let Some((trip_url, notify)) = &self.trip {
                if trip_url == url {
                    notify.notify_one();
                }
            }
            match self.pages.get(url) {
                Some(body) => {
                    if url.contains("/job/") {
                        self.served_postings.fetch_add(1, Ordering::SeqCst);
                    }
                    FetchOutcome::Fetched(FetchedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    body: body.clone(),
                    fetched_at: Utc::now(),
                    })
                }
                None => FetchOutcome::failed(url, FetchFailureReason::HttpStatus(404)),
            }
        }
    }

    fn config(batch_size: usize, workers: usize) -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.discovery.auto_discover = false;
        config.discovery.categories = vec!["backend".into(), "data".into()];
        config.discovery.include_remote = false;
        config.discovery.include_uncategorized = false;
        config.discovery.page_depth = 1;
        config.batch_size = batch_size;
        config.workers = workers;
        config.flush_backoff.max_retries = 1;
        config.flush_backoff.base_delay = Duration::from_millis(1);
        config
    }

    async fn run(site: FakeSite, config: HarvestConfig, store: &JobStore) -> Result<HarvestSummary> {
        SyncPipeline::new(config, Arc::new(site), store.clone())
            .run(std::future::pending())
            .await
    }

    #[tokio::test]
    async fn overlapping_listings_persist_each_posting_once() {
        let store = JobStore::in_memory().await.unwrap();
        let site = FakeSite::default()
            .listing(BACKEND, &["a", "b"])
            .listing(DATA, &["b", "c"])
            .posting("a", "Senior Python Developer", "Python and AWS", Some("Warszawa"))
            .posting("b", "Data Analyst", "SQL", Some("Kraków"))
            .posting("c", "Junior QA", "Selenium", Some("Gdańsk"));

        let summary = run(site, config(2, 3), &store).await.unwrap();
        assert_eq!(summary.discovered_postings, 3);
        assert_eq!(summary.extracted, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.phase, HarvestPhase::Idle);
        assert!(!summary.interrupted);
        assert_eq!(summary.metrics.clean_rows, 3);
        assert_eq!(summary.metrics.raw_rows, 3);

        let a = store.get(&job("a")).await.unwrap().unwrap();
        assert_eq!(a.seniority.as_deref(), Some("Mid"));
        assert_eq!(a.skills.as_deref(), Some("aws,python"));
        assert_eq!(a.posted_at.as_deref(), Some("2026-04-01"));
    }

    #[tokio::test]
    async fn rerun_overwrites_changed_postings_and_leaves_others() {
        let store = JobStore::in_memory().await.unwrap();
        let first = FakeSite::default()
            .listing(BACKEND, &["a", "b"])
            .listing(DATA, &["b", "c"])
            .posting("a", "Backend Dev", "Go", None)
            .posting("b", "Data Analyst", "SQL", Some("Kraków"))
            .posting("c", "QA", "Selenium", Some("Gdańsk"));
        run(first, config(10, 2), &store).await.unwrap();

        let second = FakeSite::default()
            .listing(DATA, &["b", "c"])
            .posting("b", "Senior Data Analyst", "SQL", Some("Kraków"))
            .posting("c", "QA", "Selenium", Some("Gdańsk"));
        let summary = run(second, config(10, 2), &store).await.unwrap();
        assert_eq!(summary.listing_failures, 1);
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.updated, 2);

        let b = store.get(&job("b")).await.unwrap().unwrap();
        assert_eq!(b.title, "Senior Data Analyst");
        let a = store.get(&job("a")).await.unwrap().unwrap();
        assert_eq!(a.title, "Backend Dev");
        assert_eq!(a.location.as_deref(), Some("unspecified"));
        assert_eq!(store.metrics().await.unwrap().clean_rows, 3);
    }

    #[tokio::test]
    async fn skip_existing_leaves_persisted_ids_out_of_the_queue() {
        let store = JobStore::in_memory().await.unwrap();
        let site = || {
            FakeSite::default()
                .listing(BACKEND, &["a", "b"])
                .posting("a", "A", "", None)
                .posting("b", "B", "", None)
        };
        run(site(), config(10, 1), &store).await.unwrap();

        let mut cfg = config(10, 1);
        cfg.skip_existing = true;
        let summary = run(site(), cfg, &store).await.unwrap();
        assert_eq!(summary.skipped_existing, 2);
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.fetched, 0);
    }

    #[tokio::test]
    async fn remote_hint_sets_location_sentinel() {
        let store = JobStore::in_memory().await.unwrap();
        let site = FakeSite::default()
            .listing(BACKEND, &["r"])
            .posting("r", "Data Engineer", "Praca zdalnie", None);
        run(site, config(10, 1), &store).await.unwrap();
        let row = store.get(&job("r")).await.unwrap().unwrap();
        assert_eq!(row.location.as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn failed_fetches_and_untitled_pages_do_not_stop_the_run() {
        let store = JobStore::in_memory().await.unwrap();
        let site = FakeSite::default()
            .listing(BACKEND, &["ok", "gone", "blank"])
            .posting("ok", "Dev", "", None)
            .page(&job("blank"), "<html><body>nothing</body></html>".to_string());
        let summary = run(site, config(10, 2), &store).await.unwrap();
        assert_eq!(summary.fetch_failures, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn interruption_flushes_buffered_postings() {
        let store = JobStore::in_memory().await.unwrap();
        let notify = Arc::new(Notify::new());
        let mut site = FakeSite::default()
            .listing(BACKEND, &["a", "b", "stuck"])
            .posting("a", "A", "", None)
            .posting("b", "B", "", None);
        site.hang = Some((job("stuck"), Arc::clone(&notify)));

        let shutdown = async move { notify.notified().await };
        let summary = SyncPipeline::new(config(100, 1), Arc::new(site), store.clone())
            .run(shutdown)
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.batches, 1);
        assert!(store.get(&job("a")).await.unwrap().is_some());
        assert!(store.get(&job("b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_discovery_is_not_an_error() {
        let store = JobStore::in_memory().await.unwrap();
        let summary = run(FakeSite::default(), config(10, 1), &store).await.unwrap();
        assert_eq!(summary.listing_failures, 2);
        assert_eq!(summary.discovered_postings, 0);
        assert_eq!(summary.batches, 0);
    }

    #[tokio::test]
    async fn interruption_keeps_postings_blocked_on_a_full_channel() {
        let store = JobStore::in_memory().await.unwrap();
        let slugs = (0..30).map(|i| format!("p{i}")).collect::<Vec<_>>();
        let slug_refs = slugs.iter().map(String::as_str).collect::<Vec<_>>();
        let mut site = FakeSite::default().listing(BACKEND, &slug_refs);
        for slug in &slugs {
            site = site.posting(slug, &format!("Role {slug}"), "", None);
        }
        let notify = Arc::new(Notify::new());
        site.trip = Some((job("p16"), Arc::clone(&notify)));
        let served = Arc::clone(&site.served_postings);

        // One worker and a 16-slot channel: the 17th posting is fetched while the channel is full.
        let shutdown = async move { notify.notified().await };
        let summary = SyncPipeline::new(config(16, 1), Arc::new(site), store.clone())
            .run(shutdown)
            .await
            .unwrap();

        let served = served.load(Ordering::SeqCst);
        assert!(summary.interrupted);
        assert!(served >= 17 && served < 30, "served {served}");
        assert_eq!(summary.extracted, served);
        assert_eq!(summary.inserted, served);
        assert_eq!(summary.metrics.clean_rows, served as i64);
        assert!(store.get(&job("p16")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn posting_cap_limits_the_fetch_queue() {
        let site = || {
            FakeSite::default()
                .listing(BACKEND, &["a", "b", "c"])
                .posting("a", "A", "", None)
                .posting("b", "B", "", None)
                .posting("c", "C", "", None)
        };

        let store = JobStore::in_memory().await.unwrap();
        let mut capped = config(10, 2);
        capped.max_postings = 2;
        let summary = run(site(), capped, &store).await.unwrap();
        assert_eq!(summary.discovered_postings, 3);
        assert_eq!(summary.queued, 2);
        assert_eq!(summary.fetched, 2);
        assert_eq!(store.metrics().await.unwrap().clean_rows, 2);

        let store = JobStore::in_memory().await.unwrap();
        let mut uncapped = config(10, 2);
        uncapped.max_postings = 0;
        let summary = run(site(), uncapped, &store).await.unwrap();
        assert_eq!(summary.queued, 3);
        assert_eq!(store.metrics().await.unwrap().clean_rows, 3);
    }

    #[tokio::test]
    async fn persistent_storage_failure_fails_the_run_with_counts() {
        let store = JobStore::in_memory().await.unwrap();
        sqlx::query("DROP TABLE jobs_clean")
            .execute(store.pool())
            .await
            .unwrap();
        let site = FakeSite::default()
            .listing(BACKEND, &["a"])
            .posting("a", "A", "", None);
        let err = run(site, config(10, 1), &store).await.unwrap_err();
        assert!(format!("{err:#}").contains("after 2 attempts"));

        let failed = err.downcast_ref::<HarvestFailed>().expect("summary attached");
        assert_eq!(failed.summary.phase, HarvestPhase::Failed);
        assert_eq!(failed.summary.discovered_postings, 1);
        assert_eq!(failed.summary.fetched, 1);
        assert_eq!(failed.summary.persisted(), 0);
        assert_eq!(failed.summary.flush_retries, 1);
        assert!(err.to_string().contains("discovered=1 fetched=1"));
    }

    /// Restores the dropped clean table shortly after the first flush starts.
    struct RestoreSchemaOnce {
        store: std::sync::Mutex<Option<JobStore>>,
        inner: PostingEnrichmentHook,
    }

    impl EnrichmentHook for RestoreSchemaOnce {
        fn apply(&self, items: Vec<StagedPosting>) -> Result<Vec<StagedPosting>> {
            if let Some(store) = self.store.lock().unwrap().take() {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    store.migrate().await.unwrap();
                });
            }
            self.inner.apply(items)
        }
    }

    #[tokio::test]
    async fn transient_storage_failure_is_retried() {
        let store = JobStore::in_memory().await.unwrap();
        sqlx::query("DROP TABLE jobs_clean")
            .execute(store.pool())
            .await
            .unwrap();
        let site = FakeSite::default()
            .listing(BACKEND, &["a"])
            .posting("a", "A", "", None);

        let mut cfg = config(10, 1);
        cfg.flush_backoff.max_retries = 3;
        cfg.flush_backoff.base_delay = Duration::from_millis(400);
        let hook = RestoreSchemaOnce {
            store: std::sync::Mutex::new(Some(store.clone())),
            inner: PostingEnrichmentHook::new(SkillDictionary::default()),
        };
        let summary = SyncPipeline::new(cfg, Arc::new(site), store.clone())
            .with_hooks(Box::new(FirstSeenDedupHook), Box::new(hook))
            .run(std::future::pending())
            .await
            .unwrap();

        assert_eq!(summary.phase, HarvestPhase::Idle);
        assert!(summary.flush_retries >= 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.metrics().await.unwrap().clean_rows, 1);
        assert_eq!(store.raw_rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn raw_dump_writes_one_file_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::in_memory().await.unwrap();
        let mut cfg = config(1, 1);
        cfg.raw_dump = true;
        cfg.raw_dump_dir = dir.path().to_path_buf();
        let site = FakeSite::default()
            .listing(BACKEND, &["a", "b"])
            .posting("a", "A", "", None)
            .posting("b", "B", "", None);
        run(site, cfg, &store).await.unwrap();

        let dumps = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("nofluffjobs_") && name.ends_with(".jsonl"))
            .count();
        assert_eq!(dumps, 2);
    }
}
