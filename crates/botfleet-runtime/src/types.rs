//! Runtime types.

use std::collections::BTreeMap;

use botfleet_core::{ResearchJob, ResearchMode};
use botfleet_store::JobCounts;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a unit of work was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    BudgetExhausted,
    DailyJobLimit,
    MaxConcurrent,
    QueueFull,
    CircuitOpen,
}

impl DeferReason {
    /// Human-readable reason stored on the deferred job.
    pub fn message(&self) -> &'static str {
        match self {
            Self::BudgetExhausted => "Budget exhausted",
            Self::DailyJobLimit => "Daily job limit reached",
            Self::MaxConcurrent => "Max concurrent",
            Self::QueueFull => "Queue full",
            Self::CircuitOpen => "Provider circuit open",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::BudgetExhausted => "budget_exhausted",
            Self::DailyJobLimit => "daily_job_limit",
            Self::MaxConcurrent => "max_concurrent",
            Self::QueueFull => "queue_full",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// Verdict from one admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Defer(DeferReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Result of proposing a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Admitted and waiting for a worker.
    Queued(ResearchJob),
    /// Rejected by admission control; persisted as a DEFERRED job.
    Deferred(ResearchJob),
    /// Same work seen within the fingerprint TTL; no job created.
    Duplicate {
        fingerprint_hash: String,
        hit_count: u32,
    },
}

impl SubmitOutcome {
    pub fn job(&self) -> Option<&ResearchJob> {
        match self {
            Self::Queued(job) | Self::Deferred(job) => Some(job),
            Self::Duplicate { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued(_) => "queued",
            Self::Deferred(_) => "deferred",
            Self::Duplicate { .. } => "duplicate",
        }
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub due: Vec<ResearchMode>,
    pub queued: Vec<ResearchMode>,
    pub deferred: Vec<ResearchMode>,
    pub duplicates: Vec<ResearchMode>,
    pub budget_reset: bool,
}

/// Budget utilization band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetLevel {
    Healthy,
    Throttled,
    Critical,
    Exhausted,
}

/// Daily cost ledger snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub daily_budget_usd: f64,
    pub used_today_usd: f64,
    pub reserved_usd: f64,
    pub utilization: f64,
    pub level: BudgetLevel,
    pub daily_job_count: u32,
    pub budget_reset_at: DateTime<Utc>,
}

/// Provider circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub total_submissions: u64,
    pub duplicates_blocked: u64,
    pub efficiency: f64,
    pub live_fingerprints: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferralStats {
    pub submissions: u64,
    pub deferred: u64,
    pub deferral_rate: f64,
    pub by_reason: BTreeMap<String, u64>,
}

/// Diagnostics exposed to the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorMetrics {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub dedup: DedupStats,
    pub deferrals: DeferralStats,
    /// Counts over the observation window.
    pub window: JobCounts,
    /// `(failed + timeout) / (completed + failed + timeout)` over the window.
    pub failure_rate: Option<f64>,
    pub timeouts_in_window: usize,
    pub started_at: DateTime<Utc>,
}
