//! Shared application state.

use std::sync::Arc;

use botfleet_core::FleetConfig;
use botfleet_runtime::Orchestrator;
use chrono::{DateTime, Utc};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: FleetConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: FleetConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            started_at: Utc::now(),
        }
    }
}
