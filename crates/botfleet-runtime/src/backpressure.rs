//! Deferral bookkeeping: every admission rejection becomes a DEFERRED job.

use std::collections::BTreeMap;

use botfleet_core::{ResearchJob, Result};
use parking_lot::Mutex;
use tracing::warn;

use crate::types::{DeferralStats, DeferReason};

#[derive(Default)]
struct Counters {
    submissions: u64,
    deferred: u64,
    by_reason: BTreeMap<DeferReason, u64>,
}

#[derive(Default)]
pub struct DeferralPolicy {
    counters: Mutex<Counters>,
}

impl DeferralPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a unit of work that reached admission control.
    pub fn record_submission(&self) {
        self.counters.lock().submissions += 1;
    }

    /// Move a QUEUED job to DEFERRED with the reason's message.
    pub fn defer(&self, job: &mut ResearchJob, reason: DeferReason) -> Result<()> {
        job.defer(reason.message())?;
        let mut counters = self.counters.lock();
        counters.deferred += 1;
        *counters.by_reason.entry(reason).or_insert(0) += 1;
        warn!(
            "Deferred {} job {}: {}",
            job.mode,
            job.id,
            reason.message()
        );
        Ok(())
    }

    pub fn stats(&self) -> DeferralStats {
        let counters = self.counters.lock();
        let deferral_rate = if counters.submissions == 0 {
            0.0
        } else {
            counters.deferred as f64 / counters.submissions as f64
        };
        DeferralStats {
            submissions: counters.submissions,
            deferred: counters.deferred,
            deferral_rate,
            by_reason: counters
                .by_reason
                .iter()
                .map(|(reason, n)| (reason.key().to_string(), *n))
                .collect(),
        }
    }
}
