//! Read-only JSON API over the cleaned job table.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobharvest_storage::{JobQuery, JobRow, JobStore, SkillCount};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobharvest-web";

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
}

impl AppState {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct JobsParams {
    pub q: Option<String>,
    pub location: Option<String>,
    pub seniority: Option<String>,
    pub limit: Option<usize>,
}

impl JobsParams {
    fn into_query(self) -> JobQuery {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        JobQuery {
            title: clean(self.q),
            location: clean(self.location),
            seniority: clean(self.seniority),
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TrendingParams {
    top: Option<usize>,
}

/// One row of `GET /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOut {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub skills: Vec<String>,
    pub seniority: String,
    pub source: String,
    pub posted_at: Option<String>,
    pub url: Option<String>,
}

impl From<JobRow> for JobOut {
    fn from(row: JobRow) -> Self {
        let skills = row.skill_list().into_iter().map(str::to_string).collect();
        Self {
            id: row.id,
            title: row.title,
            company: row.company.unwrap_or_default(),
            location: row.location.unwrap_or_default(),
            skills,
            seniority: row.seniority.unwrap_or_default(),
            source: row.source.unwrap_or_default(),
            posted_at: row.posted_at,
            url: row.url,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(jobs_handler))
        .route("/skills/trending", get(trending_skills_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: JobStore, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn jobs_handler(State(state): State<Arc<AppState>>, Query(params): Query<JobsParams>) -> Response {
    match state.store.query(&params.into_query()).await {
        Ok(rows) => Json(rows.into_iter().map(JobOut::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn trending_skills_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TrendingParams>,
) -> Response {
    let top = params.top.unwrap_or(10).clamp(1, MAX_LIMIT);
    match state.store.skill_counts(top).await {
        Ok(counts) => Json::<Vec<SkillCount>>(counts).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
