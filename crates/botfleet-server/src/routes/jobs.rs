//! Job listing and lookup.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use botfleet_core::{Error, JobStatus, ResearchMode};
use botfleet_store::JobFilter;
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::state::AppState;

const MAX_LIMIT: usize = 500;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
}

#[derive(Deserialize)]
struct JobsQuery {
    status: Option<String>,
    mode: Option<String>,
    limit: Option<String>,
}

impl JobsQuery {
    fn into_filter(self) -> botfleet_core::Result<JobFilter> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<JobStatus>())
            .transpose()?;
        let mode = self
            .mode
            .filter(|m| !m.is_empty())
            .map(|m| m.parse::<ResearchMode>())
            .transpose()?;
        let limit = match self.limit.filter(|l| !l.is_empty()) {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::InvalidInput(format!("invalid limit '{}'", raw)))?
                .min(MAX_LIMIT),
            None => 0,
        };
        Ok(JobFilter {
            status,
            mode,
            limit,
        })
    }
}

/// GET /api/jobs?status=&mode=&limit=, newest first.
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> impl IntoResponse {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(e) => return error_response(e),
    };
    match state.orchestrator.list_jobs(&filter) {
        Ok(jobs) => (
            StatusCode::OK,
            Json(json!({
                "jobs": jobs,
                "count": jobs.len(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// GET /api/jobs/{id}
async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orchestrator.get_job(&id) {
        Ok(job) => (StatusCode::OK, Json(json!(job))),
        Err(e) => error_response(e),
    }
}
