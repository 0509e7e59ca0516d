//! Liveness and storage statistics.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use super::error_response;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
}

/// GET /api/health: liveness.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
        "running": orchestrator.running(),
        "queued": orchestrator.queue_depth(),
        "openAlerts": orchestrator.list_alerts(false).map(|a| a.len()).unwrap_or(0),
    }))
}

/// GET /api/stats: storage statistics.
async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.orchestrator.store().get_stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "jobs": stats.jobs,
                "totalJobs": stats.jobs.total(),
                "fingerprints": stats.fingerprints,
                "alerts": stats.alerts,
                "dbPath": stats.db_path,
                "dbSizeMb": stats.db_size_mb,
                "port": state.config.port,
                "dataDir": state.config.data_paths.root.display().to_string(),
            })),
        ),
        Err(e) => error_response(e),
    }
}
