use std::path::PathBuf;
use std::time::Duration;

use jobharvest_adapters::{DiscoveryConfig, DEFAULT_CATEGORIES};
use jobharvest_storage::{BackoffPolicy, HttpClientConfig};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/jobs.db";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: String,
    pub discovery: DiscoveryConfig,
    pub http: HttpClientConfig,
    pub workers: usize,
    pub batch_size: usize,
    pub max_postings: usize,
    pub skip_existing: bool,
    pub keep_first_posted_at: bool,
    /// Retry schedule for a failed batch upsert.
    pub flush_backoff: BackoffPolicy,
    pub skills_file: PathBuf,
    pub raw_dump: bool,
    pub raw_dump_dir: PathBuf,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset, blank and unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: usize| {
            var(key)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| var(key).map(|v| parse_bool(&v)).unwrap_or(default);

        let database_url = var("DATABASE_URL")
            .or_else(|| var("DB_PATH").map(|path| format!("sqlite://{path}")))
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let categories = var("HARVEST_CATEGORIES")
            .map(|raw| {
                raw.split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect());

        let discovery = DiscoveryConfig {
            country: var("HARVEST_COUNTRY")
                .map(|c| c.to_ascii_lowercase())
                .unwrap_or_else(|| "pl".to_string()),
            categories,
            auto_discover: flag("HARVEST_AUTO_DISCOVER", true),
            include_remote: flag("HARVEST_INCLUDE_REMOTE", true),
            include_uncategorized: flag("HARVEST_INCLUDE_UNCATEGORIZED", true),
            page_depth: number("HARVEST_PAGE_DEPTH", 3).max(1),
        };

        let workers = number("HARVEST_WORKERS", 8).max(1);
        let defaults = HttpClientConfig::default();
        let http = HttpClientConfig {
            timeout: Duration::from_secs(number("HARVEST_HTTP_TIMEOUT_SECS", 20) as u64),
            user_agent: var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            accept_language: var("HARVEST_ACCEPT_LANGUAGE").unwrap_or(defaults.accept_language),
            max_in_flight: workers,
            request_delay: Duration::from_millis(number("HARVEST_REQUEST_DELAY_MS", 500) as u64),
            backoff: defaults.backoff,
        };

        Self {
            database_url,
            discovery,
            http,
            workers,
            batch_size: number("HARVEST_BATCH_SIZE", 100).max(1),
            max_postings: number("HARVEST_MAX_POSTINGS", 10_000),
            skip_existing: flag("HARVEST_SKIP_EXISTING", false),
            keep_first_posted_at: flag("HARVEST_KEEP_FIRST_POSTED_AT", false),
            flush_backoff: BackoffPolicy {
                max_retries: number("HARVEST_FLUSH_RETRIES", 3),
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
            },
            skills_file: var("HARVEST_SKILLS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/skills.yaml")),
            raw_dump: flag("RAW_DUMP", false),
            raw_dump_dir: var("RAW_DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/raw")),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
