//! Network fetch, raw dump artifacts and job persistence for jobharvest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod db;

pub use db::{JobQuery, JobRow, JobStore, SkillCount, StoreError, StoreMetrics, UpsertPolicy, UpsertReport};

pub const CRATE_NAME: &str = "jobharvest-storage";

#[derive(Debug, Clone)]
pub struct StoredDump {
    pub content_hash: String,
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
}

/// Diagnostic JSONL dumps of harvest batches.
#[derive(Debug, Clone)]
pub struct DumpStore {
    root: PathBuf,
}

impl DumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn dump_file_name(name: &str, written_at: DateTime<Utc>, batch_no: usize) -> String {
        let stamp = written_at.format("%Y%m%d_%H%M%S");
        format!("{name}_{stamp}_{batch_no:03}.jsonl")
    }

    /// Write one JSON document per line via a temp file and an atomic rename.
    pub async fn write_jsonl<T: Serialize>(
        &self,
        name: &str,
        written_at: DateTime<Utc>,
        batch_no: usize,
        rows: &[T],
    ) -> anyhow::Result<StoredDump> {
        let mut bytes = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut bytes, row).context("serializing dump row")?;
            bytes.push(b'\n');
        }

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating dump directory {}", self.root.display()))?;

        let path = self
            .root
            .join(Self::dump_file_name(name, written_at, batch_no));
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp dump file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp dump file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp dump file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp dump {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredDump {
            content_hash: Self::sha256_hex(&bytes),
            path,
            rows: rows.len(),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
    pub max_in_flight: usize,
    /// Pause after every request, held by the requesting worker.
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string(),
            accept_language: "pl-PL,pl;q=0.9,en;q=0.8".to_string(),
            max_in_flight: 16,
            request_delay: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FetchFailureReason {
    HttpStatus(u16),
    Timeout,
    Connect,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub url: String,
    pub reason: FetchFailureReason,
}

/// Result of a single page fetch. Fetchers report failures here instead of erroring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(FetchedPage),
    Failed(FetchFailure),
}

impl FetchOutcome {
    pub fn failed(url: impl Into<String>, reason: FetchFailureReason) -> Self {
        FetchOutcome::Failed(FetchFailure {
            url: url.into(),
            reason,
        })
    }

    pub fn into_body(self) -> Option<String> {
        match self {
            FetchOutcome::Fetched(page) => Some(page.body),
            FetchOutcome::Failed(_) => None,
        }
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, FetchOutcome::Fetched(_))
    }
}

/// The only network boundary of the harvester.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> FetchOutcome;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for Arc<T> {
    async fn fetch_page(&self, url: &str) -> FetchOutcome {
        (**self).fetch_page(url).await
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn into_failure(self, url: &str) -> FetchFailure {
        let reason = match self {
            FetchError::HttpStatus { status, .. } => FetchFailureReason::HttpStatus(status),
            FetchError::Request(err) if err.is_timeout() => FetchFailureReason::Timeout,
            FetchError::Request(err) if err.is_connect() => FetchFailureReason::Connect,
            FetchError::Request(err) => FetchFailureReason::Other(err.to_string()),
        };
        FetchFailure {
            url: url.to_string(),
            reason,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    request_delay: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("invalid accept-language header")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            request_delay: config.request_delay,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            url: url.to_string(),
                            final_url,
                            status: status.as_u16(),
                            body,
                            fetched_at: Utc::now(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> FetchOutcome {
        let span = info_span!("http_fetch", url);
        async {
            let Ok(_permit) = self.in_flight.acquire().await else {
                return FetchOutcome::failed(url, FetchFailureReason::Other("fetcher closed".into()));
            };

            let outcome = match self.fetch_with_retries(url).await {
                Ok(page) => FetchOutcome::Fetched(page),
                Err(err) => {
                    warn!(error = %err, "fetch failed");
                    FetchOutcome::Failed(err.into_failure(url))
                }
            };

            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: String,
        title: String,
    }

    #[test]
    fn dump_hashing_is_stable() {
        let hash = DumpStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn dump_file_names_are_timestamped() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 5, 9).single().unwrap();
        assert_eq!(
            DumpStore::dump_file_name("nofluffjobs", at, 7),
            "nofluffjobs_20260224_120509_007.jsonl"
        );
    }

    #[tokio::test]
    async fn jsonl_dump_writes_one_line_per_row() {
        let dir = tempdir().expect("tempdir");
        let store = DumpStore::new(dir.path().join("raw"));
        let rows = vec![
            Row { id: "a".into(), title: "Data Engineer".into() },
            Row { id: "b".into(), title: "Analyst".into() },
        ];
        let written_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();

        let stored = store
            .write_jsonl("nofluffjobs", written_at, 1, &rows)
            .await
            .expect("dump");

        assert_eq!(stored.rows, 2);
        let text = std::fs::read_to_string(&stored.path).expect("read dump");
        let parsed: Vec<Row> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("line"))
            .collect();
        assert_eq!(parsed, rows);
        assert_eq!(stored.content_hash, DumpStore::sha256_hex(text.as_bytes()));
        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn status_errors_map_to_explicit_failures() {
        let failure = FetchError::HttpStatus {
            status: 404,
            url: "https://nofluffjobs.com/job/x".into(),
        }
        .into_failure("https://nofluffjobs.com/job/x");
        assert_eq!(failure.reason, FetchFailureReason::HttpStatus(404));
        assert!(FetchOutcome::Failed(failure).into_body().is_none());
    }

    #[tokio::test]
    async fn unreachable_host_yields_failure_not_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(500),
            request_delay: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("fetcher");
        let outcome = fetcher.fetch_page("http://127.0.0.1:9/unreachable").await;
        assert!(!outcome.is_fetched());
    }
}
