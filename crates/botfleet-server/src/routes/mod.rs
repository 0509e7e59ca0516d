//! HTTP route handlers.

pub mod alerts;
pub mod health;
pub mod jobs;
pub mod orchestrator;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use botfleet_core::Error;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::routes())
        .merge(orchestrator::routes())
        .merge(jobs::routes())
        .merge(alerts::routes())
}

/// Map a domain error onto a status code and `{"error": ...}` body.
pub(crate) fn error_response(err: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) | Error::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        _ => {
            error!("Request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}
