//! Orchestrator control routes: state, budget, metrics, toggles and submissions.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use botfleet_core::{JobTrigger, ResearchMode, WorkUnit};
use botfleet_runtime::SubmitOutcome;
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orchestrator/state", get(get_state))
        .route("/orchestrator/budget", get(get_budget))
        .route("/orchestrator/metrics", get(get_metrics))
        .route("/orchestrator/modes/{mode}", put(set_mode_enabled))
        .route("/orchestrator/modes/{mode}/trigger", post(trigger_mode))
        .route("/orchestrator/full-spectrum", put(set_full_spectrum))
        .route("/orchestrator/submissions", post(submit))
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct SubmissionRequest {
    mode: String,
    subject: String,
    #[serde(default)]
    params: serde_json::Value,
    priority: Option<i32>,
}

/// GET /api/orchestrator/state
async fn get_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot())
}

/// GET /api/orchestrator/budget
async fn get_budget(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.budget_state())
}

/// GET /api/orchestrator/metrics
async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.orchestrator.metrics() {
        Ok(metrics) => (StatusCode::OK, Json(json!(metrics))),
        Err(e) => error_response(e),
    }
}

/// PUT /api/orchestrator/modes/{mode}
async fn set_mode_enabled(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    let mode: ResearchMode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => return error_response(e),
    };
    match state.orchestrator.set_mode_enabled(mode, req.enabled) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(e) => error_response(e),
    }
}

/// POST /api/orchestrator/modes/{mode}/trigger
async fn trigger_mode(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> impl IntoResponse {
    let mode: ResearchMode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => return error_response(e),
    };
    match state.orchestrator.trigger_mode(mode) {
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => error_response(e),
    }
}

/// PUT /api/orchestrator/full-spectrum
async fn set_full_spectrum(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    match state.orchestrator.set_full_spectrum(req.enabled) {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(e) => error_response(e),
    }
}

/// POST /api/orchestrator/submissions: external work proposal.
async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmissionRequest>,
) -> impl IntoResponse {
    let mode: ResearchMode = match req.mode.parse() {
        Ok(mode) => mode,
        Err(e) => return error_response(e),
    };
    let work = WorkUnit {
        mode,
        trigger: JobTrigger::Api,
        subject: req.subject,
        params: req.params,
        priority: req.priority.unwrap_or_else(|| mode.default_priority()),
        scheduled_for: None,
    };
    match state.orchestrator.submit(work) {
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => error_response(e),
    }
}

/// 201 when a job row was created, 200 for a duplicate.
fn outcome_response(outcome: &SubmitOutcome) -> (StatusCode, Json<serde_json::Value>) {
    match outcome {
        SubmitOutcome::Queued(job) | SubmitOutcome::Deferred(job) => (
            StatusCode::CREATED,
            Json(json!({
                "outcome": outcome.label(),
                "job": job,
            })),
        ),
        SubmitOutcome::Duplicate {
            fingerprint_hash,
            hit_count,
        } => (
            StatusCode::OK,
            Json(json!({
                "outcome": outcome.label(),
                "fingerprintHash": fingerprint_hash,
                "hitCount": hit_count,
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use botfleet_core::OrchestratorConfig;
    use serde_json::json;

    use crate::routes::test_support::TestApp;

    #[tokio::test]
    async fn test_state_reflects_toggles() {
        let app = TestApp::new();

        let (status, body) = app.send("GET", "/api/orchestrator/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isFullSpectrumEnabled"], false);
        assert_eq!(body["enabledModes"], json!(["SENTIMENT_BURST"]));

        let (status, body) = app
            .send(
                "PUT",
                "/api/orchestrator/modes/deep-reasoning",
                Some(json!({ "enabled": true })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabledModes"], json!(["SENTIMENT_BURST", "DEEP_REASONING"]));

        let (status, body) = app
            .send(
                "PUT",
                "/api/orchestrator/full-spectrum",
                Some(json!({ "enabled": true })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isFullSpectrumEnabled"], true);
        assert!(app.state.orchestrator.snapshot().is_full_spectrum_enabled);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_bad_request() {
        let app = TestApp::new();
        let (status, body) = app
            .send("POST", "/api/orchestrator/modes/moonshot/trigger", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("moonshot"));
    }

    #[tokio::test]
    async fn test_trigger_then_duplicate() {
        let app = TestApp::new();

        let (status, body) = app
            .send("POST", "/api/orchestrator/modes/CONTRARIAN_SCAN/trigger", None)
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "queued");
        assert_eq!(body["job"]["mode"], "CONTRARIAN_SCAN");
        assert_eq!(body["job"]["trigger"], "MANUAL");
        assert_eq!(app.state.orchestrator.queue_depth(), 1);

        // Same minute, same mode: deduplicated.
        let (status, body) = app
            .send("POST", "/api/orchestrator/modes/CONTRARIAN_SCAN/trigger", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "duplicate");
        assert_eq!(body["hitCount"], 2);
    }

    #[tokio::test]
    async fn test_submission_queues_and_dedups() {
        let app = TestApp::new();
        let proposal = json!({
            "mode": "SENTIMENT_BURST",
            "subject": "BTC funding flip",
            "params": { "symbols": ["BTC"] },
        });

        let (status, body) = app
            .send("POST", "/api/orchestrator/submissions", Some(proposal.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "queued");
        assert_eq!(body["job"]["trigger"], "API");
        assert_eq!(body["job"]["status"], "QUEUED");
        assert_eq!(body["job"]["priority"], 30);

        let (status, body) = app
            .send("POST", "/api/orchestrator/submissions", Some(proposal))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "duplicate");

        let (_, metrics) = app.send("GET", "/api/orchestrator/metrics", None).await;
        assert_eq!(metrics["queued"], 1);
        assert_eq!(metrics["dedup"]["duplicatesBlocked"], 1);
        assert_eq!(metrics["circuit"], "CLOSED");
    }

    #[tokio::test]
    async fn test_submission_over_job_limit_is_deferred() {
        let app = TestApp::with_config(OrchestratorConfig {
            max_daily_jobs: Some(0),
            ..Default::default()
        });

        let (status, body) = app
            .send(
                "POST",
                "/api/orchestrator/submissions",
                Some(json!({ "mode": "DEEP_REASONING", "subject": "ETH supply", "priority": 5 })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "deferred");
        assert_eq!(body["job"]["status"], "DEFERRED");
        assert_eq!(body["job"]["deferredReason"], "Daily job limit reached");
        assert_eq!(body["job"]["priority"], 5);
        assert_eq!(app.state.orchestrator.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_empty_subject_is_rejected() {
        let app = TestApp::new();
        let (status, _) = app
            .send(
                "POST",
                "/api/orchestrator/submissions",
                Some(json!({ "mode": "SENTIMENT_BURST", "subject": "  " })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_budget_snapshot() {
        let app = TestApp::new();
        let (status, body) = app.send("GET", "/api/orchestrator/budget", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dailyBudgetUsd"], 50.0);
        assert_eq!(body["level"], "HEALTHY");
    }
}
