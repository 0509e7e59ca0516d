//! Research job model and lifecycle.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Named research cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResearchMode {
    /// Short, frequent sentiment sweeps.
    SentimentBurst,
    /// Scans for crowded trades worth fading.
    ContrarianScan,
    /// Slow, expensive long-form reasoning.
    DeepReasoning,
}

impl ResearchMode {
    pub const ALL: [ResearchMode; 3] = [
        ResearchMode::SentimentBurst,
        ResearchMode::ContrarianScan,
        ResearchMode::DeepReasoning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SentimentBurst => "SENTIMENT_BURST",
            Self::ContrarianScan => "CONTRARIAN_SCAN",
            Self::DeepReasoning => "DEEP_REASONING",
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            Self::SentimentBurst => Duration::minutes(30),
            Self::ContrarianScan => Duration::hours(2),
            Self::DeepReasoning => Duration::hours(6),
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            Self::SentimentBurst => 30,
            Self::ContrarianScan => 20,
            Self::DeepReasoning => 10,
        }
    }

    pub fn cost_class(&self) -> CostClass {
        match self {
            Self::SentimentBurst => CostClass::Low,
            Self::ContrarianScan => CostClass::Medium,
            Self::DeepReasoning => CostClass::High,
        }
    }
}

impl fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResearchMode {
    type Err = Error;

    /// Accepts `SENTIMENT_BURST`, `sentiment_burst` and `sentiment-burst`.
    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown research mode '{}'", raw)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostClass {
    Low,
    Medium,
    High,
}

impl CostClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl FromStr for CostClass {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(Error::InvalidInput(format!("unknown cost class '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Deferred,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Deferred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Deferred => "DEFERRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Deferred
        )
    }

    /// Legal edges: QUEUED→{RUNNING,DEFERRED}, RUNNING→{COMPLETED,FAILED,TIMEOUT}.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Deferred)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Timeout)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status '{}'", raw)))
    }
}

/// What caused a job to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobTrigger {
    Cadence,
    Manual,
    Api,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cadence => "CADENCE",
            Self::Manual => "MANUAL",
            Self::Api => "API",
        }
    }
}

impl FromStr for JobTrigger {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CADENCE" => Ok(Self::Cadence),
            "MANUAL" => Ok(Self::Manual),
            "API" => Ok(Self::Api),
            other => Err(Error::InvalidInput(format!("unknown trigger '{}'", other))),
        }
    }
}

/// A unit of scheduled research work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchJob {
    pub id: String,
    pub mode: ResearchMode,
    pub status: JobStatus,
    pub priority: i32,
    pub cost_class: CostClass,
    pub trigger: JobTrigger,
    pub subject: String,
    pub params: serde_json::Value,
    pub fingerprint_hash: String,
    pub estimated_cost_usd: f64,
    pub cost_usd: f64,
    pub candidates_created: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred_reason: Option<String>,
}

impl ResearchJob {
    /// Build a QUEUED job. The id is assigned by the caller.
    pub fn queued(
        id: String,
        work: &WorkUnit,
        estimated_cost_usd: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mode: work.mode,
            status: JobStatus::Queued,
            priority: work.priority,
            cost_class: work.mode.cost_class(),
            trigger: work.trigger,
            subject: work.subject.clone(),
            params: work.params.clone(),
            fingerprint_hash: work.fingerprint(),
            estimated_cost_usd,
            cost_usd: 0.0,
            candidates_created: 0,
            attempts: 0,
            created_at: now,
            scheduled_for: work.scheduled_for.unwrap_or(now),
            started_at: None,
            completed_at: None,
            error_message: None,
            deferred_reason: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn defer(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Deferred)?;
        self.deferred_reason = Some(reason.into());
        Ok(())
    }

    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        cost_usd: f64,
        candidates_created: u32,
    ) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now);
        self.cost_usd = cost_usd;
        self.candidates_created = candidates_created;
        Ok(())
    }

    pub fn fail(&mut self, now: DateTime<Utc>, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(now);
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn time_out(&mut self, now: DateTime<Utc>, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Timeout)?;
        self.completed_at = Some(now);
        self.error_message = Some(message.into());
        Ok(())
    }
}

/// Proposed work before admission. Becomes a [`ResearchJob`] once admitted or deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnit {
    pub mode: ResearchMode,
    pub trigger: JobTrigger,
    pub subject: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub priority: i32,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// Content fingerprint: SHA-256 over mode, subject and canonical params.
    ///
    /// Trigger, priority and schedule are deliberately left out so the same
    /// research proposed twice collides regardless of who proposed it.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.mode.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.subject.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
        // serde_json::Value maps are BTreeMap-backed, so key order is stable.
        hasher.update(self.params.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Persisted orchestrator state, one row per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub is_full_spectrum_enabled: bool,
    pub enabled_modes: BTreeSet<ResearchMode>,
    pub last_sentiment_at: Option<DateTime<Utc>>,
    pub last_contrarian_at: Option<DateTime<Utc>>,
    pub last_deep_reasoning_at: Option<DateTime<Utc>>,
    pub daily_cost_usd: f64,
    pub daily_job_count: u32,
    pub budget_reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorState {
    /// Fresh state: only sentiment bursts enabled, nothing run yet.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_full_spectrum_enabled: false,
            enabled_modes: BTreeSet::from([ResearchMode::SentimentBurst]),
            last_sentiment_at: None,
            last_contrarian_at: None,
            last_deep_reasoning_at: None,
            daily_cost_usd: 0.0,
            daily_job_count: 0,
            budget_reset_at: utc_day_start(now),
            updated_at: now,
        }
    }

    pub fn last_run_at(&self, mode: ResearchMode) -> Option<DateTime<Utc>> {
        match mode {
            ResearchMode::SentimentBurst => self.last_sentiment_at,
            ResearchMode::ContrarianScan => self.last_contrarian_at,
            ResearchMode::DeepReasoning => self.last_deep_reasoning_at,
        }
    }

    pub fn set_last_run_at(&mut self, mode: ResearchMode, at: DateTime<Utc>) {
        match mode {
            ResearchMode::SentimentBurst => self.last_sentiment_at = Some(at),
            ResearchMode::ContrarianScan => self.last_contrarian_at = Some(at),
            ResearchMode::DeepReasoning => self.last_deep_reasoning_at = Some(at),
        }
    }

    /// Modes eligible for dispatch: all of them under Full Spectrum.
    pub fn active_modes(&self) -> Vec<ResearchMode> {
        if self.is_full_spectrum_enabled {
            ResearchMode::ALL.to_vec()
        } else {
            self.enabled_modes.iter().copied().collect()
        }
    }

    pub fn is_mode_active(&self, mode: ResearchMode) -> bool {
        self.is_full_spectrum_enabled || self.enabled_modes.contains(&mode)
    }
}

/// Midnight UTC of the day containing `at`.
pub fn utc_day_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Dedup record for a piece of proposed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFingerprint {
    pub fingerprint_hash: String,
    pub hit_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CandidateFingerprint {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    OrchestratorStalled,
    BudgetThrottled,
    HighFailureRate,
    BackpressureBuilding,
    SchedulingDrift,
}

impl AlertType {
    pub const ALL: [AlertType; 5] = [
        AlertType::OrchestratorStalled,
        AlertType::BudgetThrottled,
        AlertType::HighFailureRate,
        AlertType::BackpressureBuilding,
        AlertType::SchedulingDrift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrchestratorStalled => "ORCHESTRATOR_STALLED",
            Self::BudgetThrottled => "BUDGET_THROTTLED",
            Self::HighFailureRate => "HIGH_FAILURE_RATE",
            Self::BackpressureBuilding => "BACKPRESSURE_BUILDING",
            Self::SchedulingDrift => "SCHEDULING_DRIFT",
        }
    }
}

impl FromStr for AlertType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown alert type '{}'", raw)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(Error::InvalidInput(format!("unknown severity '{}'", other))),
        }
    }
}

/// Operational alert derived from live metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set while the triggering condition is no longer present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Open until it has been both acknowledged and resolved.
    pub fn is_open(&self) -> bool {
        !(self.acknowledged && self.resolved_at.is_some())
    }
}
