//! Operational alerts.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertsQuery {
    #[serde(default)]
    include_closed: bool,
}

/// GET /api/alerts?includeClosed=
async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    match state.orchestrator.list_alerts(query.include_closed) {
        Ok(alerts) => (
            StatusCode::OK,
            Json(json!({
                "alerts": alerts,
                "count": alerts.len(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// POST /api/alerts/{id}/acknowledge
async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.acknowledge_alert(&id) {
        Ok(alert) => (StatusCode::OK, Json(json!(alert))),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Duration;
    use serde_json::json;

    use crate::routes::test_support::TestApp;

    #[tokio::test]
    async fn test_drift_alert_lifecycle() {
        let app = TestApp::new();
        let (status, _) = app
            .send(
                "POST",
                "/api/orchestrator/submissions",
                Some(json!({ "mode": "SENTIMENT_BURST", "subject": "LINK oracle flows" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        // Nobody claims the job for 15 minutes.
        app.clock.advance(Duration::minutes(15));
        app.state.orchestrator.evaluate_alerts().unwrap();

        let (status, body) = app.send("GET", "/api/alerts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        let alert = &body["alerts"][0];
        assert_eq!(alert["type"], "SCHEDULING_DRIFT");
        assert_eq!(alert["severity"], "warning");
        assert_eq!(alert["acknowledged"], false);
        let id = alert["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .send("POST", &format!("/api/alerts/{}/acknowledge", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["acknowledged"], true);

        // Acknowledged but the condition persists: still open.
        let (_, body) = app.send("GET", "/api/alerts", None).await;
        assert_eq!(body["count"], 1);

        // Draining the queue clears the condition and closes the alert.
        assert!(app.state.orchestrator.claim_next().unwrap().is_some());
        app.state.orchestrator.evaluate_alerts().unwrap();

        let (_, body) = app.send("GET", "/api/alerts", None).await;
        assert_eq!(body["count"], 0);

        let (_, body) = app.send("GET", "/api/alerts?includeClosed=true", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["alerts"][0]["id"], id);
        assert!(body["alerts"][0]["resolvedAt"].is_string());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert() {
        let app = TestApp::new();
        let (status, body) = app
            .send("POST", "/api/alerts/nope/acknowledge", None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }
}
