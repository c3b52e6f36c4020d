//! SQLite persistence for the raw and clean job tables.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use jobharvest_core::JobPosting;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid database url {url}: {source}")]
    InvalidUrl { url: String, source: sqlx::Error },
    #[error("creating database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Conflict handling for ids that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertPolicy {
    /// Keep the stored `posted_at` instead of taking the incoming one.
    pub keep_first_posted_at: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StoreMetrics {
    pub clean_rows: i64,
    pub raw_rows: i64,
    pub distinct_companies: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillCount {
    pub skill: String,
    pub count: usize,
}

/// Filters of the downstream read contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    /// Case-insensitive substring of the title.
    pub title: Option<String>,
    /// Case-insensitive substring of the location.
    pub location: Option<String>,
    /// Exact level or a prefix of it.
    pub seniority: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct JobRow {
    pub id: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub posted_at: Option<String>,
    pub url: Option<String>,
    pub skills: Option<String>,
    pub seniority: Option<String>,
}

impl JobRow {
    pub fn skill_list(&self) -> Vec<&str> {
        self.skills
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Shared handle over the job tables. Batch writes are serialized.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl JobStore {
    /// Connect and create the schema. Accepts `sqlite://path`, `sqlite:path` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|source| StoreError::InvalidUrl {
                url: database_url.to_string(),
                source,
            })?
            .create_if_missing(true);

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
        }

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup; uniqueness of `id` is enforced by an index.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs_table (
                id TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT,
                location TEXT,
                "desc" TEXT,
                source TEXT,
                posted_at TEXT,
                url TEXT,
                seniority TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs_clean (
                id TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT,
                location TEXT,
                "desc" TEXT,
                source TEXT,
                posted_at TEXT,
                url TEXT,
                skills TEXT,
                seniority TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_table_id ON jobs_table(id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_clean_id ON jobs_clean(id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert-or-update a batch into both tables inside one transaction.
    pub async fn upsert_batch(
        &self,
        postings: &[JobPosting],
        policy: UpsertPolicy,
    ) -> Result<UpsertReport, StoreError> {
        if postings.is_empty() {
            return Ok(UpsertReport::default());
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();

        for posting in postings {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs_table WHERE id = ?1")
                .bind(&posting.id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_some() {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }

            sqlx::query(
                r#"
                INSERT INTO jobs_table (id, title, company, location, "desc", source, posted_at, url, seniority)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    company = excluded.company,
                    location = excluded.location,
                    "desc" = excluded."desc",
                    source = excluded.source,
                    posted_at = CASE WHEN ?10 THEN COALESCE(jobs_table.posted_at, excluded.posted_at)
                                     ELSE excluded.posted_at END,
                    url = excluded.url,
                    seniority = excluded.seniority
                "#,
            )
            .bind(&posting.id)
            .bind(&posting.title)
            .bind(&posting.company)
            .bind(&posting.location)
            .bind(&posting.description)
            .bind(&posting.source)
            .bind(&posting.posted_at)
            .bind(&posting.url)
            .bind(posting.seniority.as_str())
            .bind(policy.keep_first_posted_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO jobs_clean (id, title, company, location, "desc", source, posted_at, url, skills, seniority)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    company = excluded.company,
                    location = excluded.location,
                    "desc" = excluded."desc",
                    source = excluded.source,
                    posted_at = CASE WHEN ?11 THEN COALESCE(jobs_clean.posted_at, excluded.posted_at)
                                     ELSE excluded.posted_at END,
                    url = excluded.url,
                    skills = excluded.skills,
                    seniority = excluded.seniority
                "#,
            )
            .bind(&posting.id)
            .bind(&posting.title)
            .bind(&posting.company)
            .bind(&posting.location)
            .bind(&posting.description)
            .bind(&posting.source)
            .bind(&posting.posted_at)
            .bind(&posting.url)
            .bind(posting.skills_joined())
            .bind(posting.seniority.as_str())
            .bind(policy.keep_first_posted_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(inserted = report.inserted, updated = report.updated, "batch committed");
        Ok(report)
    }

    pub async fn existing_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM jobs_clean")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRow>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, title, company, location, "desc" AS description, source, posted_at, url, skills, seniority
              FROM jobs_clean
             WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Rows of the raw table, oldest insert first. `skills` is always empty there.
    pub async fn raw_rows(&self) -> Result<Vec<JobRow>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, title, company, location, "desc" AS description, source, posted_at, url,
                   NULL AS skills, seniority
              FROM jobs_table
             ORDER BY rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Filtered read over the clean table, newest posting date first.
    pub async fn query(&self, query: &JobQuery) -> Result<Vec<JobRow>, StoreError> {
        let mut sql = String::from(
            r#"SELECT id, title, company, location, "desc" AS description, source, posted_at, url, skills, seniority
                 FROM jobs_clean
                WHERE 1 = 1"#,
        );
        if query.title.is_some() {
            sql.push_str(" AND instr(lower(title), lower(?)) > 0");
        }
        if query.location.is_some() {
            sql.push_str(" AND instr(lower(location), lower(?)) > 0");
        }
        if query.seniority.is_some() {
            sql.push_str(" AND instr(lower(seniority), lower(?)) = 1");
        }
        sql.push_str(" ORDER BY posted_at DESC, rowid DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, JobRow>(&sql);
        for value in [&query.title, &query.location, &query.seniority]
            .into_iter()
            .flatten()
        {
            q = q.bind(value.trim());
        }
        let rows = q.bind(query.limit as i64).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn metrics(&self) -> Result<StoreMetrics, StoreError> {
        let (clean_rows, distinct_companies): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COUNT(DISTINCT company) FROM jobs_clean")
                .fetch_one(&self.pool)
                .await?;
        let raw_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs_table")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreMetrics {
            clean_rows,
            raw_rows,
            distinct_companies,
        })
    }

    /// Most frequent skills across the clean table.
    pub async fn skill_counts(&self, top: usize) -> Result<Vec<SkillCount>, StoreError> {
        let all: Vec<Option<String>> = sqlx::query_scalar("SELECT skills FROM jobs_clean")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for skill in all
            .iter()
            .flatten()
            .flat_map(|s| s.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            *counts.entry(skill.to_string()).or_default() += 1;
        }

        let mut out = counts
            .into_iter()
            .map(|(skill, count)| SkillCount { skill, count })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.skill.cmp(&b.skill)));
        out.truncate(top);
        Ok(out)
    }
}
