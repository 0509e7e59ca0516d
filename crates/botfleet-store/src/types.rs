//! Query and statistics types.

use botfleet_core::{JobStatus, ResearchMode};
use serde::{Deserialize, Serialize};

/// Filter for job listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub mode: Option<ResearchMode>,
    pub limit: usize,
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub deferred: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Timeout => self.timeout += count,
            JobStatus::Deferred => self.deferred += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed + self.timeout + self.deferred
    }
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub jobs: JobCounts,
    pub fingerprints: i64,
    pub alerts: i64,
    pub db_path: String,
    pub db_size_mb: f64,
}
