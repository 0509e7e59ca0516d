//! Database schema SQL. Timestamps are epoch milliseconds.

/// Research jobs are append-and-update only; rows are never deleted.
pub const JOBS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS research_jobs (
    id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    cost_class TEXT NOT NULL,
    trigger_kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    params_json TEXT,
    fingerprint_hash TEXT NOT NULL,
    estimated_cost_usd REAL NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    candidates_created INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    scheduled_for INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    error_message TEXT,
    deferred_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON research_jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_mode ON research_jobs(mode);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON research_jobs(created_at);
"#;

/// Singleton state row (id is always 1).
pub const STATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS orchestrator_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    is_full_spectrum_enabled INTEGER NOT NULL DEFAULT 0,
    enabled_modes_json TEXT NOT NULL DEFAULT '[]',
    last_sentiment_at INTEGER,
    last_contrarian_at INTEGER,
    last_deep_reasoning_at INTEGER,
    daily_cost_usd REAL NOT NULL DEFAULT 0,
    daily_job_count INTEGER NOT NULL DEFAULT 0,
    budget_reset_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

pub const FINGERPRINT_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS candidate_fingerprints (
    fingerprint_hash TEXT PRIMARY KEY,
    hit_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fingerprints_expires ON candidate_fingerprints(expires_at);
"#;

pub const ALERTS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    alert_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    acknowledged_at INTEGER,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_alerts_type ON alerts(alert_type);
"#;
