//! Daily cost ledger and budget admission.
//!
//! All ledger mutation goes through [`BudgetGuard`]; concurrent job
//! completions serialize on its lock so no settlement is lost.

use botfleet_core::{utc_day_start, OrchestratorConfig, OrchestratorState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

use crate::types::{Admission, BudgetLevel, BudgetState, DeferReason};

const EPSILON: f64 = 1e-9;

struct Ledger {
    daily_budget_usd: f64,
    used_today_usd: f64,
    reserved_usd: f64,
    daily_job_count: u32,
    reset_at: DateTime<Utc>,
}

pub struct BudgetGuard {
    ledger: Mutex<Ledger>,
    max_daily_jobs: Option<u32>,
    throttle_utilization: f64,
    critical_utilization: f64,
}

impl BudgetGuard {
    /// Restore the ledger from persisted state.
    pub fn restore(config: &OrchestratorConfig, state: &OrchestratorState) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                daily_budget_usd: config.daily_budget_usd,
                used_today_usd: state.daily_cost_usd,
                reserved_usd: 0.0,
                daily_job_count: state.daily_job_count,
                reset_at: state.budget_reset_at,
            }),
            max_daily_jobs: config.max_daily_jobs,
            throttle_utilization: config.throttle_utilization,
            critical_utilization: config.critical_utilization,
        }
    }

    /// Zero the daily counters if `now` is past the current ledger day.
    ///
    /// Reservations for in-flight jobs carry over.
    pub fn rollover_if_needed(&self, now: DateTime<Utc>) -> bool {
        let today = utc_day_start(now);
        let mut ledger = self.ledger.lock();
        if today <= ledger.reset_at {
            return false;
        }
        info!(
            "Daily budget reset: spent ${:.2} over {} jobs on {}",
            ledger.used_today_usd,
            ledger.daily_job_count,
            ledger.reset_at.format("%Y-%m-%d")
        );
        ledger.used_today_usd = 0.0;
        ledger.daily_job_count = 0;
        ledger.reset_at = today;
        true
    }

    pub fn authorize(&self, estimated_cost_usd: f64) -> Admission {
        let ledger = self.ledger.lock();
        if let Some(max) = self.max_daily_jobs {
            if ledger.daily_job_count >= max {
                return Admission::Defer(DeferReason::DailyJobLimit);
            }
        }
        if ledger.used_today_usd + EPSILON >= ledger.daily_budget_usd {
            return Admission::Defer(DeferReason::BudgetExhausted);
        }
        let committed = ledger.used_today_usd + ledger.reserved_usd + estimated_cost_usd;
        if committed > ledger.daily_budget_usd + EPSILON {
            return Admission::Defer(DeferReason::BudgetExhausted);
        }
        Admission::Allow
    }

    /// Count an admitted job and hold its estimated cost.
    pub fn record_admission(&self, estimated_cost_usd: f64) {
        let mut ledger = self.ledger.lock();
        ledger.daily_job_count = ledger.daily_job_count.saturating_add(1);
        ledger.reserved_usd += estimated_cost_usd;
    }

    /// Undo [`record_admission`](Self::record_admission) when the job never got persisted.
    pub fn revert_admission(&self, estimated_cost_usd: f64) {
        let mut ledger = self.ledger.lock();
        ledger.daily_job_count = ledger.daily_job_count.saturating_sub(1);
        ledger.reserved_usd = (ledger.reserved_usd - estimated_cost_usd).max(0.0);
    }

    /// Hold an estimate without counting a new job (restart restore).
    pub fn reserve(&self, estimated_cost_usd: f64) {
        self.ledger.lock().reserved_usd += estimated_cost_usd;
    }

    /// Drop a reservation for a job that will not run.
    pub fn release(&self, estimated_cost_usd: f64) {
        let mut ledger = self.ledger.lock();
        ledger.reserved_usd = (ledger.reserved_usd - estimated_cost_usd).max(0.0);
    }

    /// Release the reservation and charge what the job actually cost.
    pub fn settle(&self, estimated_cost_usd: f64, actual_cost_usd: f64) {
        let mut ledger = self.ledger.lock();
        ledger.reserved_usd = (ledger.reserved_usd - estimated_cost_usd).max(0.0);
        ledger.used_today_usd += actual_cost_usd.max(0.0);
    }

    pub fn utilization(&self) -> f64 {
        let ledger = self.ledger.lock();
        ledger.used_today_usd / ledger.daily_budget_usd
    }

    pub fn snapshot(&self) -> BudgetState {
        let ledger = self.ledger.lock();
        let utilization = ledger.used_today_usd / ledger.daily_budget_usd;
        BudgetState {
            daily_budget_usd: ledger.daily_budget_usd,
            used_today_usd: ledger.used_today_usd,
            reserved_usd: ledger.reserved_usd,
            utilization,
            level: classify_utilization(
                utilization,
                self.throttle_utilization,
                self.critical_utilization,
            ),
            daily_job_count: ledger.daily_job_count,
            budget_reset_at: ledger.reset_at,
        }
    }

    /// Copy the daily counters into a state snapshot.
    pub fn write_into(&self, state: &mut OrchestratorState) {
        let ledger = self.ledger.lock();
        state.daily_cost_usd = ledger.used_today_usd;
        state.daily_job_count = ledger.daily_job_count;
        state.budget_reset_at = ledger.reset_at;
    }
}

pub fn classify_utilization(utilization: f64, throttle: f64, critical: f64) -> BudgetLevel {
    if utilization + EPSILON >= 1.0 {
        BudgetLevel::Exhausted
    } else if utilization + EPSILON >= critical {
        BudgetLevel::Critical
    } else if utilization + EPSILON >= throttle {
        BudgetLevel::Throttled
    } else {
        BudgetLevel::Healthy
    }
}
