//! Orchestrator: owns scheduling state and runs admission control.
//!
//! Every path that creates a job (cadence tick, manual trigger, API
//! submission) goes through the same pipeline: fingerprint dedup, then the
//! circuit, budget, concurrency and queue-depth gates. Rejected work is
//! persisted as DEFERRED; admitted work is persisted as QUEUED and handed to
//! the worker pool.

use std::sync::Arc;

use botfleet_core::{
    Alert, Clock, Error, JobStatus, JobTrigger, OrchestratorConfig, OrchestratorState,
    ResearchJob, ResearchMode, Result, WorkUnit,
};
use botfleet_store::{JobFilter, SqliteStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::alerts::{evaluate_conditions, failure_rate, AlertEngine, AlertThresholds, HealthMetrics};
use crate::backpressure::DeferralPolicy;
use crate::budget::BudgetGuard;
use crate::cadence::{cadence_work, due_modes, manual_work, CadenceController};
use crate::concurrency::{ConcurrencyLimiter, RunPermit};
use crate::fingerprint::FingerprintStore;
use crate::provider::{ProviderError, ProviderOutput, ResearchProvider};
use crate::queue::JobQueue;
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::types::*;

/// A job promoted to RUNNING together with its concurrency slot.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: ResearchJob,
    permit: RunPermit,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    /// Serializes every path that creates jobs or edits toggles.
    admission: Mutex<()>,
    state: Mutex<OrchestratorState>,
    queue: Mutex<JobQueue>,
    budget: BudgetGuard,
    limiter: ConcurrencyLimiter,
    fingerprints: FingerprintStore,
    cadence: CadenceController,
    deferrals: DeferralPolicy,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    alerts: AlertEngine,
    thresholds: AlertThresholds,
    work_available: Notify,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    /// Restore from storage and recover from an unclean shutdown.
    ///
    /// Jobs left RUNNING are failed; QUEUED jobs go back on the queue with
    /// their budget reservations.
    pub fn load(
        config: OrchestratorConfig,
        store: Arc<SqliteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now();
        let state = match store.load_state()? {
            Some(state) => state,
            None => {
                let state = OrchestratorState::new(now);
                store.save_state(&state)?;
                state
            }
        };

        let budget = BudgetGuard::restore(&config, &state);

        let mut interrupted = Vec::new();
        for mut job in store.jobs_with_status(JobStatus::Running)? {
            job.fail(now, "Interrupted by restart")?;
            store.update_job(&job)?;
            warn!("Job {} was running at shutdown, marked failed", job.id);
            interrupted.push(job.fingerprint_hash);
        }
        // Interrupted work may be proposed again.
        store.delete_fingerprints(&interrupted)?;

        let mut queue = JobQueue::new();
        for job in store.jobs_with_status(JobStatus::Queued)? {
            budget.reserve(job.estimated_cost_usd);
            queue.push(job);
        }

        let fingerprints = FingerprintStore::with_entries(
            config.fingerprint_ttl(),
            config.fingerprint_max_entries,
            store.load_live_fingerprints(now)?,
        );
        let alerts = AlertEngine::new(store.load_open_alerts()?);

        info!(
            "Orchestrator restored: {} queued, {} interrupted, {} live fingerprints, \
             full_spectrum={}",
            queue.len(),
            interrupted.len(),
            fingerprints.stats().live_fingerprints,
            state.is_full_spectrum_enabled
        );

        let orchestrator = Self {
            limiter: ConcurrencyLimiter::new(&config),
            breaker: CircuitBreaker::from_config(&config),
            retry: RetryPolicy::from_config(&config),
            thresholds: AlertThresholds::from_config(&config),
            cadence: CadenceController::new(),
            deferrals: DeferralPolicy::new(),
            admission: Mutex::new(()),
            state: Mutex::new(state),
            queue: Mutex::new(queue),
            work_available: Notify::new(),
            started_at: now,
            config,
            store,
            clock,
            budget,
            fingerprints,
            alerts,
        };

        if orchestrator.budget.rollover_if_needed(now) {
            orchestrator.persist_state(now)?;
        }
        Ok(orchestrator)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Signalled whenever a job is queued.
    pub fn work_available(&self) -> &Notify {
        &self.work_available
    }

    // ---------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------

    /// One dispatcher tick: daily reset, then submit whatever the cadence says is due.
    pub fn tick(&self) -> Result<TickReport> {
        let _admission = self.admission.lock();
        let now = self.clock.now();
        let mut report = TickReport::default();

        if self.budget.rollover_if_needed(now) {
            report.budget_reset = true;
            self.persist_state(now)?;
        }

        let snapshot = self.state.lock().clone();
        report.due = due_modes(now, &snapshot, &self.config);
        let planned = self.cadence.plan(now, &snapshot, &self.config);
        let full_spectrum = snapshot.is_full_spectrum_enabled;

        for mode in planned {
            let work = cadence_work(mode, now, &self.config);
            match self.submit_locked(work, now) {
                Ok(SubmitOutcome::Queued(_)) => {
                    self.cadence.record(mode, false, full_spectrum, now);
                    report.queued.push(mode);
                }
                Ok(SubmitOutcome::Deferred(_)) => {
                    self.cadence.record(mode, true, full_spectrum, now);
                    report.deferred.push(mode);
                }
                Ok(SubmitOutcome::Duplicate { .. }) => {
                    // This slot's work already exists; the cadence is covered.
                    self.cadence.record(mode, false, full_spectrum, now);
                    self.mark_covered(mode, now)?;
                    report.duplicates.push(mode);
                }
                Err(e) => error!("Cadence submission for {} failed: {}", mode, e),
            }
        }

        if !report.queued.is_empty() || !report.deferred.is_empty() {
            debug!(
                "Tick: due={:?} queued={:?} deferred={:?} duplicates={:?}",
                report.due, report.queued, report.deferred, report.duplicates
            );
        }
        Ok(report)
    }

    /// Propose a unit of work from outside the cadence.
    pub fn submit(&self, work: WorkUnit) -> Result<SubmitOutcome> {
        let _admission = self.admission.lock();
        let now = self.clock.now();
        self.budget.rollover_if_needed(now);
        self.submit_locked(work, now)
    }

    /// Run a mode now, regardless of its cadence or enablement.
    pub fn trigger_mode(&self, mode: ResearchMode) -> Result<SubmitOutcome> {
        let _admission = self.admission.lock();
        let now = self.clock.now();
        self.budget.rollover_if_needed(now);
        let outcome = self.submit_locked(manual_work(mode, now, &self.config), now)?;
        if let SubmitOutcome::Queued(job) = &outcome {
            self.cadence.clear_deferral(mode);
            info!("Manual trigger queued {} job {}", mode, job.id);
        }
        Ok(outcome)
    }

    pub fn set_full_spectrum(&self, enabled: bool) -> Result<OrchestratorState> {
        let _admission = self.admission.lock();
        info!("Full Spectrum {}", if enabled { "enabled" } else { "disabled" });
        self.update_state(|state| state.is_full_spectrum_enabled = enabled)
    }

    pub fn set_mode_enabled(&self, mode: ResearchMode, enabled: bool) -> Result<OrchestratorState> {
        let _admission = self.admission.lock();
        info!("Mode {} {}", mode, if enabled { "enabled" } else { "disabled" });
        self.update_state(|state| {
            if enabled {
                state.enabled_modes.insert(mode);
            } else {
                state.enabled_modes.remove(&mode);
            }
        })
    }

    fn submit_locked(&self, work: WorkUnit, now: DateTime<Utc>) -> Result<SubmitOutcome> {
        if work.subject.trim().is_empty() {
            return Err(Error::InvalidInput("subject must not be empty".into()));
        }

        let hash = work.fingerprint();
        let check = self.fingerprints.check_and_record(&hash, now);
        if let Err(e) = self.store.upsert_fingerprint(&check.record) {
            error!("Failed to persist fingerprint {}: {}", hash, e);
        }
        if !check.evicted.is_empty() {
            if let Err(e) = self.store.delete_fingerprints(&check.evicted) {
                error!("Failed to delete evicted fingerprints: {}", e);
            }
        }
        if check.is_duplicate {
            debug!("Duplicate {} work '{}' (hit {})", work.mode, work.subject, check.hit_count);
            return Ok(SubmitOutcome::Duplicate {
                fingerprint_hash: hash,
                hit_count: check.hit_count,
            });
        }

        self.deferrals.record_submission();
        let estimate = self.config.estimated_cost(work.mode.cost_class());
        let mut job = ResearchJob::queued(uuid::Uuid::new_v4().to_string(), &work, estimate, now);

        if let Admission::Defer(reason) = self.admit(&job, now) {
            self.deferrals.defer(&mut job, reason)?;
            self.forget_fingerprint(&hash);
            self.store.insert_job(&job)?;
            return Ok(SubmitOutcome::Deferred(job));
        }

        self.budget.record_admission(estimate);
        let advances_cadence = matches!(work.trigger, JobTrigger::Cadence | JobTrigger::Manual);
        {
            let mut state = self.state.lock();
            let mut next = state.clone();
            if advances_cadence {
                next.set_last_run_at(work.mode, now);
            }
            self.budget.write_into(&mut next);
            next.updated_at = now;
            if let Err(e) = self.store.record_dispatch(&job, &next) {
                self.budget.revert_admission(estimate);
                self.forget_fingerprint(&hash);
                return Err(e);
            }
            *state = next;
        }

        info!(
            "Queued {} job {} (priority {}, est ${:.2}, {})",
            job.mode,
            job.id,
            job.priority,
            estimate,
            job.trigger.as_str()
        );
        self.queue.lock().push(job.clone());
        self.work_available.notify_one();
        Ok(SubmitOutcome::Queued(job))
    }

    /// Circuit, budget, concurrency, then queue depth. First rejection wins.
    fn admit(&self, job: &ResearchJob, now: DateTime<Utc>) -> Admission {
        let gates = [
            self.breaker.authorize(now),
            self.budget.authorize(job.estimated_cost_usd),
            self.limiter.authorize(job.mode),
        ];
        if let Some(deferred) = gates.into_iter().find(|a| !a.is_allowed()) {
            return deferred;
        }
        if self.queue.lock().len() >= self.config.max_queue_depth {
            return Admission::Defer(DeferReason::QueueFull);
        }
        Admission::Allow
    }

    fn mark_covered(&self, mode: ResearchMode, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        state.set_last_run_at(mode, now);
        self.budget.write_into(&mut state);
        state.updated_at = now;
        self.store.save_state(&state)
    }

    fn update_state(&self, edit: impl FnOnce(&mut OrchestratorState)) -> Result<OrchestratorState> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut next = state.clone();
        edit(&mut next);
        self.budget.write_into(&mut next);
        next.updated_at = now;
        self.store.save_state(&next)?;
        *state = next.clone();
        Ok(next)
    }

    fn persist_state(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        self.budget.write_into(&mut state);
        state.updated_at = now;
        self.store.save_state(&state)
    }

    fn forget_fingerprint(&self, hash: &str) {
        if self.fingerprints.forget(hash) {
            if let Err(e) = self.store.delete_fingerprints(&[hash.to_string()]) {
                error!("Failed to delete fingerprint {}: {}", hash, e);
            }
        }
    }

    // ---------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------

    /// Promote the best QUEUED job to RUNNING.
    ///
    /// A job that cannot get a concurrency slot, or that would call a
    /// provider whose circuit is open, is deferred instead.
    pub fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        loop {
            let Some(mut job) = self.queue.lock().pop() else {
                return Ok(None);
            };
            let now = self.clock.now();

            let permit = match self.limiter.try_acquire(job.mode) {
                Ok(permit) => permit,
                Err(reason) => {
                    self.defer_claimed(job, reason)?;
                    continue;
                }
            };
            if !self.breaker.try_begin_call(now) {
                drop(permit);
                self.defer_claimed(job, DeferReason::CircuitOpen)?;
                continue;
            }

            let queued = job.clone();
            if let Err(e) = job.start(now).and_then(|()| self.store.update_job(&job)) {
                // Still QUEUED on disk with its reservation held; put it back.
                self.breaker.abandon_call();
                drop(permit);
                self.queue.lock().push(queued);
                error!("Failed to start job {}: {}", job.id, e);
                return Err(e);
            }
            info!("Started {} job {}", job.mode, job.id);
            return Ok(Some(ClaimedJob { job, permit }));
        }
    }

    fn defer_claimed(&self, mut job: ResearchJob, reason: DeferReason) -> Result<()> {
        self.deferrals.defer(&mut job, reason)?;
        self.budget.release(job.estimated_cost_usd);
        self.forget_fingerprint(&job.fingerprint_hash);
        self.store.update_job(&job)
    }

    /// Run a claimed job to a terminal state and settle its cost.
    pub async fn execute(
        &self,
        claimed: ClaimedJob,
        provider: &dyn ResearchProvider,
    ) -> Result<ResearchJob> {
        let ClaimedJob { mut job, permit } = claimed;
        let timeout = self.config.job_timeout();

        let outcome = tokio::time::timeout(timeout, self.call_with_retry(&mut job, provider)).await;
        let now = self.clock.now();

        match outcome {
            Ok(Ok(output)) => {
                job.complete(now, output.cost_usd, output.candidates_created)?;
                self.budget.settle(job.estimated_cost_usd, output.cost_usd);
                info!(
                    "Completed {} job {}: {} candidates, ${:.3} after {} attempt(s)",
                    job.mode, job.id, output.candidates_created, output.cost_usd, job.attempts
                );
            }
            Ok(Err(e)) => {
                job.fail(now, e.to_string())?;
                self.budget.release(job.estimated_cost_usd);
                self.forget_fingerprint(&job.fingerprint_hash);
                warn!("Job {} failed after {} attempt(s): {}", job.id, job.attempts, e);
            }
            Err(_) => {
                self.breaker.record_failure(now);
                job.time_out(now, format!("Exceeded {}s timeout", timeout.as_secs()))?;
                self.budget.release(job.estimated_cost_usd);
                self.forget_fingerprint(&job.fingerprint_hash);
                warn!("Job {} timed out after {}s", job.id, timeout.as_secs());
            }
        }

        self.store.update_job(&job)?;
        if let Err(e) = self.persist_state(now) {
            error!("Failed to persist state after job {}: {}", job.id, e);
        }
        drop(permit);
        Ok(job)
    }

    async fn call_with_retry(
        &self,
        job: &mut ResearchJob,
        provider: &dyn ResearchProvider,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        let mut retries = 0;
        loop {
            job.attempts += 1;
            match provider.execute(job).await {
                Ok(output) => {
                    self.breaker.record_success();
                    return Ok(output);
                }
                Err(e) => {
                    self.breaker.record_failure(self.clock.now());
                    let circuit_open = self.breaker.state() == CircuitState::Open;
                    if !e.is_transient() || self.retry.is_exhausted(retries) || circuit_open {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(retries, e.retry_after());
                    warn!(
                        "{} provider error on job {} (attempt {}), retrying in {}ms: {}",
                        provider.name(),
                        job.id,
                        job.attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Health
    // ---------------------------------------------------------------

    /// Recompute alert conditions and persist any alert that changed.
    pub fn evaluate_alerts(&self) -> Result<Vec<Alert>> {
        let now = self.clock.now();
        let metrics = self.health_metrics(now)?;
        let conditions = evaluate_conditions(&metrics, &self.thresholds);
        let changed = self.alerts.apply(&conditions, now);
        for alert in &changed {
            self.store.upsert_alert(alert)?;
        }
        Ok(changed)
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> Result<Alert> {
        let now = self.clock.now();
        match self.alerts.acknowledge(alert_id, now) {
            Ok(alert) => {
                self.store.upsert_alert(&alert)?;
                Ok(alert)
            }
            Err(Error::NotFound(msg)) => match self.store.get_alert(alert_id)? {
                // Already closed; acknowledging again is a no-op.
                Some(alert) if alert.acknowledged => Ok(alert),
                _ => Err(Error::NotFound(msg)),
            },
            Err(e) => Err(e),
        }
    }

    pub fn list_alerts(&self, include_closed: bool) -> Result<Vec<Alert>> {
        if include_closed {
            self.store.list_alerts(200)
        } else {
            Ok(self.alerts.open_alerts())
        }
    }

    fn health_metrics(&self, now: DateTime<Utc>) -> Result<HealthMetrics> {
        let state = self.state.lock().clone();
        let active = state.active_modes();
        let window = self.store.count_jobs(Some(now - self.config.observation_window()))?;
        Ok(HealthMetrics {
            now,
            started_at: self.started_at,
            last_dispatch_at: active.iter().filter_map(|m| state.last_run_at(*m)).max(),
            any_mode_active: !active.is_empty(),
            budget_utilization: self.budget.utilization(),
            window,
            oldest_queued_scheduled_for: self.queue.lock().oldest_scheduled_for(),
        })
    }

    // ---------------------------------------------------------------
    // Diagnostics & maintenance
    // ---------------------------------------------------------------

    pub fn snapshot(&self) -> OrchestratorState {
        let mut state = self.state.lock().clone();
        self.budget.write_into(&mut state);
        state
    }

    pub fn budget_state(&self) -> BudgetState {
        self.budget.snapshot()
    }

    pub fn metrics(&self) -> Result<OrchestratorMetrics> {
        let now = self.clock.now();
        let window = self.store.count_jobs(Some(now - self.config.observation_window()))?;
        Ok(OrchestratorMetrics {
            running: self.limiter.running(),
            queued: self.queue_depth(),
            max_concurrent: self.limiter.max_concurrent(),
            circuit: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            dedup: self.fingerprints.stats(),
            deferrals: self.deferrals.stats(),
            failure_rate: failure_rate(&window),
            timeouts_in_window: window.timeout,
            window,
            started_at: self.started_at,
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running(&self) -> usize {
        self.limiter.running()
    }

    pub fn get_job(&self, job_id: &str) -> Result<ResearchJob> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ResearchJob>> {
        self.store.list_jobs(filter)
    }

    /// Purge expired fingerprints from memory and storage.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired = self.fingerprints.sweep(now);
        self.store.delete_fingerprints(&expired)?;
        let stale_rows = self.store.delete_expired_fingerprints(now)?;
        if !expired.is_empty() || stale_rows > 0 {
            info!("Fingerprint sweep: {} expired, {} stale rows", expired.len(), stale_rows);
        }
        Ok(expired.len())
    }

    /// Persist the current state.
    pub fn flush(&self) -> Result<()> {
        self.persist_state(self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use botfleet_core::{AlertType, ManualClock};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    type Reply = std::result::Result<ProviderOutput, ProviderError>;

    /// Replies from a script, then succeeds. Optionally sleeps per call.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Reply>>,
        calls: AtomicU32,
        delay: std::time::Duration,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Reply>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                delay: std::time::Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ResearchProvider for ScriptedProvider {
        async fn execute(&self, _job: &ResearchJob) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| Ok(output(0.03, 2)))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn output(cost_usd: f64, candidates_created: u32) -> ProviderOutput {
        ProviderOutput {
            result: json!({"ok": true}),
            candidates_created,
            cost_usd,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        }
    }

    struct Harness {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        store: Arc<SqliteStore>,
        orch: Orchestrator,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let orch = Orchestrator::load(config, store.clone(), clock.clone()).unwrap();
        Harness {
            _dir: dir,
            clock,
            store,
            orch,
        }
    }

    fn api_work(mode: ResearchMode, subject: &str) -> WorkUnit {
        WorkUnit {
            mode,
            trigger: JobTrigger::Api,
            subject: subject.into(),
            params: json!({"symbols": ["BTC"]}),
            priority: mode.default_priority(),
            scheduled_for: None,
        }
    }

    #[test]
    fn test_tick_dispatches_due_mode() {
        let h = harness(test_config());
        let report = h.orch.tick().unwrap();
        assert_eq!(report.queued, vec![ResearchMode::SentimentBurst]);
        assert_eq!(h.orch.queue_depth(), 1);

        let persisted = h.store.load_state().unwrap().unwrap();
        assert_eq!(persisted.last_sentiment_at, Some(t0()));
        assert_eq!(persisted.daily_job_count, 1);

        h.clock.advance(Duration::minutes(1));
        let report = h.orch.tick().unwrap();
        assert!(report.due.is_empty());
        assert!(report.queued.is_empty());
    }

    #[test]
    fn test_duplicate_cadence_work_advances_cadence() {
        let h = harness(test_config());
        let mut work = cadence_work(ResearchMode::SentimentBurst, t0(), h.orch.config());
        work.trigger = JobTrigger::Api;
        assert!(matches!(h.orch.submit(work).unwrap(), SubmitOutcome::Queued(_)));
        assert_eq!(h.orch.snapshot().last_sentiment_at, None);

        h.clock.advance(Duration::minutes(2));
        let report = h.orch.tick().unwrap();
        assert_eq!(report.duplicates, vec![ResearchMode::SentimentBurst]);
        assert_eq!(h.orch.snapshot().last_sentiment_at, Some(h.clock.now()));
        assert_eq!(h.orch.queue_depth(), 1);
    }

    #[test]
    fn test_budget_exhaustion_defers_once_per_retry_window() {
        let h = harness(OrchestratorConfig {
            daily_budget_usd: 0.04,
            ..test_config()
        });

        let report = h.orch.tick().unwrap();
        assert_eq!(report.deferred, vec![ResearchMode::SentimentBurst]);
        let deferred = h
            .orch
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Deferred),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].deferred_reason.as_deref(), Some("Budget exhausted"));
        assert_eq!(h.orch.snapshot().last_sentiment_at, None);

        h.clock.advance(Duration::minutes(1));
        assert!(h.orch.tick().unwrap().deferred.is_empty());

        h.clock.advance(Duration::minutes(4));
        assert_eq!(h.orch.tick().unwrap().deferred.len(), 1);
        assert_eq!(h.orch.metrics().unwrap().deferrals.by_reason.get("budget_exhausted"), Some(&2));
    }

    #[test]
    fn test_queue_full_defers() {
        let h = harness(OrchestratorConfig {
            max_queue_depth: 1,
            ..test_config()
        });
        assert!(matches!(
            h.orch.submit(api_work(ResearchMode::ContrarianScan, "eth basis")).unwrap(),
            SubmitOutcome::Queued(_)
        ));
        let outcome = h.orch.submit(api_work(ResearchMode::ContrarianScan, "sol funding")).unwrap();
        let job = outcome.job().unwrap();
        assert_eq!(job.status, JobStatus::Deferred);
        assert_eq!(job.deferred_reason.as_deref(), Some("Queue full"));
    }

    #[test]
    fn test_empty_subject_rejected() {
        let h = harness(test_config());
        let err = h.orch.submit(api_work(ResearchMode::SentimentBurst, "  ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_execute_settles_actual_cost() {
        let h = harness(test_config());
        h.orch.submit(api_work(ResearchMode::ContrarianScan, "eth basis")).unwrap();
        assert!((h.orch.budget_state().reserved_usd - 0.25).abs() < 1e-9);

        let claimed = h.orch.claim_next().unwrap().unwrap();
        assert_eq!(h.orch.running(), 1);
        let provider = ScriptedProvider::new(vec![Ok(output(0.11, 3))]);
        let job = h.orch.execute(claimed, &provider).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.candidates_created, 3);
        assert_eq!(h.orch.running(), 0);
        let budget = h.orch.budget_state();
        assert!((budget.used_today_usd - 0.11).abs() < 1e-9);
        assert_eq!(budget.reserved_usd, 0.0);
        assert_eq!(h.orch.get_job(&job.id).unwrap().status, JobStatus::Completed);
        assert!((h.store.load_state().unwrap().unwrap().daily_cost_usd - 0.11).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let h = harness(test_config());
        h.orch.submit(api_work(ResearchMode::SentimentBurst, "btc")).unwrap();
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::Transient("503".into())),
            Err(ProviderError::RateLimited { retry_after_ms: Some(2) }),
        ]);
        let claimed = h.orch.claim_next().unwrap().unwrap();
        let job = h.orch.execute(claimed, &provider).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.orch.metrics().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_frees_fingerprint() {
        let h = harness(test_config());
        let work = api_work(ResearchMode::DeepReasoning, "rates regime");
        h.orch.submit(work.clone()).unwrap();
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Persistent("400".into()))]);
        let claimed = h.orch.claim_next().unwrap().unwrap();
        let job = h.orch.execute(claimed, &provider).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(h.orch.budget_state().reserved_usd, 0.0);
        assert!(matches!(h.orch.submit(work).unwrap(), SubmitOutcome::Queued(_)));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_defers_admissions() {
        let h = harness(OrchestratorConfig {
            circuit_failure_threshold: 2,
            max_retries: 0,
            ..test_config()
        });
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::Transient("down".into())),
            Err(ProviderError::Transient("down".into())),
        ]);
        for subject in ["a", "b"] {
            h.orch.submit(api_work(ResearchMode::SentimentBurst, subject)).unwrap();
            let claimed = h.orch.claim_next().unwrap().unwrap();
            let job = h.orch.execute(claimed, &provider).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
        }
        assert_eq!(h.orch.metrics().unwrap().circuit, CircuitState::Open);

        let outcome = h.orch.submit(api_work(ResearchMode::SentimentBurst, "c")).unwrap();
        assert_eq!(
            outcome.job().unwrap().deferred_reason.as_deref(),
            Some("Provider circuit open")
        );

        // Cooldown elapsed: one trial call gets through and closes the circuit.
        h.clock.advance(Duration::seconds(300));
        h.orch.submit(api_work(ResearchMode::SentimentBurst, "d")).unwrap();
        let claimed = h.orch.claim_next().unwrap().unwrap();
        h.orch.execute(claimed, &provider).await.unwrap();
        assert_eq!(h.orch.metrics().unwrap().circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let h = harness(OrchestratorConfig {
            job_timeout_secs: 1,
            ..test_config()
        });
        h.orch.submit(api_work(ResearchMode::SentimentBurst, "btc")).unwrap();
        let mut provider = ScriptedProvider::new(Vec::new());
        provider.delay = std::time::Duration::from_secs(5);

        let claimed = h.orch.claim_next().unwrap().unwrap();
        let job = h.orch.execute(claimed, &provider).await.unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(h.orch.running(), 0);
        assert_eq!(h.orch.metrics().unwrap().timeouts_in_window, 1);
    }

    #[test]
    fn test_per_mode_ceiling_defers_at_claim() {
        let mut config = test_config();
        config.mode_limits.insert("DEEP_REASONING".into(), 1);
        let h = harness(config);
        h.orch.submit(api_work(ResearchMode::DeepReasoning, "one")).unwrap();
        h.orch.submit(api_work(ResearchMode::DeepReasoning, "two")).unwrap();

        let first = h.orch.claim_next().unwrap().unwrap();
        assert!(h.orch.claim_next().unwrap().is_none());
        let deferred = h
            .orch
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Deferred),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].deferred_reason.as_deref(), Some("Max concurrent"));
        drop(first);
        assert_eq!(h.orch.running(), 0);
    }

    #[test]
    fn test_restart_recovery() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let running_id;
        {
            let orch = Orchestrator::load(test_config(), store.clone(), clock.clone()).unwrap();
            orch.submit(api_work(ResearchMode::DeepReasoning, "rates")).unwrap();
            orch.submit(api_work(ResearchMode::ContrarianScan, "eth")).unwrap();
            let claimed = orch.claim_next().unwrap().unwrap();
            assert_eq!(claimed.job.mode, ResearchMode::ContrarianScan);
            running_id = claimed.job.id.clone();
            orch.set_full_spectrum(true).unwrap();
            // Process dies with one job running and one queued.
            std::mem::forget(claimed);
        }

        clock.advance(Duration::minutes(1));
        let orch = Orchestrator::load(test_config(), store.clone(), clock.clone()).unwrap();
        let interrupted = orch.get_job(&running_id).unwrap();
        assert_eq!(interrupted.status, JobStatus::Failed);
        assert_eq!(interrupted.error_message.as_deref(), Some("Interrupted by restart"));
        assert_eq!(orch.queue_depth(), 1);
        assert!((orch.budget_state().reserved_usd - 1.5).abs() < 1e-9);
        assert!(orch.snapshot().is_full_spectrum_enabled);

        // Queued work keeps its fingerprint; interrupted work can be re-proposed.
        let again = orch.submit(api_work(ResearchMode::DeepReasoning, "rates")).unwrap();
        assert!(matches!(again, SubmitOutcome::Duplicate { hit_count: 2, .. }));
        let retry = orch.submit(api_work(ResearchMode::ContrarianScan, "eth")).unwrap();
        assert_eq!(retry.label(), "queued");
    }

    #[test]
    fn test_mode_toggles_persist() {
        let h = harness(test_config());
        h.orch.set_mode_enabled(ResearchMode::SentimentBurst, false).unwrap();
        assert!(h.orch.tick().unwrap().due.is_empty());

        h.orch.set_mode_enabled(ResearchMode::ContrarianScan, true).unwrap();
        let persisted = h.store.load_state().unwrap().unwrap();
        assert_eq!(
            persisted.enabled_modes.into_iter().collect::<Vec<_>>(),
            vec![ResearchMode::ContrarianScan]
        );
        assert_eq!(h.orch.tick().unwrap().queued, vec![ResearchMode::ContrarianScan]);
    }

    #[test]
    fn test_manual_trigger_boosts_priority() {
        let h = harness(test_config());
        h.orch.submit(api_work(ResearchMode::SentimentBurst, "btc")).unwrap();
        let outcome = h.orch.trigger_mode(ResearchMode::DeepReasoning).unwrap();
        assert_eq!(outcome.job().unwrap().priority, 60);
        assert_eq!(h.orch.snapshot().last_deep_reasoning_at, Some(t0()));

        let claimed = h.orch.claim_next().unwrap().unwrap();
        assert_eq!(claimed.job.mode, ResearchMode::DeepReasoning);
    }

    #[test]
    fn test_backpressure_alert_lifecycle() {
        let h = harness(OrchestratorConfig {
            daily_budget_usd: 0.01,
            ..test_config()
        });
        for i in 0..10 {
            let work = api_work(ResearchMode::SentimentBurst, &format!("s{}", i));
            let outcome = h.orch.submit(work).unwrap();
            assert_eq!(outcome.label(), "deferred");
        }

        let raised = h.orch.evaluate_alerts().unwrap();
        let backpressure = raised
            .iter()
            .find(|a| a.alert_type == AlertType::BackpressureBuilding)
            .unwrap()
            .clone();

        let acked = h.orch.acknowledge_alert(&backpressure.id).unwrap();
        assert!(acked.acknowledged);
        assert!(h.store.get_alert(&backpressure.id).unwrap().unwrap().acknowledged);
        assert!(h
            .orch
            .evaluate_alerts()
            .unwrap()
            .iter()
            .all(|a| a.alert_type != AlertType::BackpressureBuilding));
        assert!(matches!(h.orch.acknowledge_alert("missing"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_long_retry_after_is_capped_by_backoff_max() {
        let h = harness(test_config());
        h.orch.submit(api_work(ResearchMode::SentimentBurst, "btc")).unwrap();
        let provider = ScriptedProvider::new(vec![Err(ProviderError::RateLimited {
            retry_after_ms: Some(u64::MAX),
        })]);
        let claimed = h.orch.claim_next().unwrap().unwrap();

        let job = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            h.orch.execute(claimed, &provider),
        )
        .await
        .expect("retry wait exceeded backoffMaxMs")
        .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_disabling_modes_leaves_running_job_alone() {
        let h = harness(test_config());
        h.orch.set_full_spectrum(true).unwrap();
        h.orch.trigger_mode(ResearchMode::DeepReasoning).unwrap();
        let claimed = h.orch.claim_next().unwrap().unwrap();
        assert_eq!(claimed.job.mode, ResearchMode::DeepReasoning);

        h.orch.set_full_spectrum(false).unwrap();
        h.orch.set_mode_enabled(ResearchMode::DeepReasoning, false).unwrap();
        assert_eq!(h.orch.running(), 1);
        assert_eq!(
            h.store.get_job(&claimed.job.id).unwrap().unwrap().status,
            JobStatus::Running
        );

        let job = h.orch.execute(claimed, &ScriptedProvider::new(vec![])).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.orch.running(), 0);
        assert!(!h.orch.snapshot().is_mode_active(ResearchMode::DeepReasoning));
    }

    #[tokio::test]
    async fn test_store_failure_at_claim_keeps_job_queued() {
        let h = harness(test_config());
        let queued = h.orch.submit(api_work(ResearchMode::SentimentBurst, "sol")).unwrap();
        let job_id = queued.job().unwrap().id.clone();
        let reserved = h.orch.budget_state().reserved_usd;

        let side = rusqlite::Connection::open(h.store.db_path()).unwrap();
        side.execute_batch(
            "CREATE TRIGGER refuse_start BEFORE UPDATE ON research_jobs
             WHEN NEW.status = 'RUNNING'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        assert!(matches!(h.orch.claim_next(), Err(Error::Database(_))));
        assert_eq!(h.orch.queue_depth(), 1);
        assert_eq!(h.orch.running(), 0);
        assert_eq!(h.orch.budget_state().reserved_usd, reserved);
        assert_eq!(h.orch.get_job(&job_id).unwrap().status, JobStatus::Queued);

        side.execute_batch("DROP TRIGGER refuse_start;").unwrap();
        let claimed = h.orch.claim_next().unwrap().unwrap();
        assert_eq!(claimed.job.id, job_id);
        let job = h.orch.execute(claimed, &ScriptedProvider::new(vec![])).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.orch.budget_state().reserved_usd, 0.0);
    }

    #[test]
    fn test_sweep_purges_expired_fingerprints() {
        let h = harness(OrchestratorConfig {
            fingerprint_ttl_hours: 1,
            ..test_config()
        });
        h.orch.submit(api_work(ResearchMode::SentimentBurst, "btc")).unwrap();
        h.clock.advance(Duration::minutes(61));
        assert_eq!(h.orch.sweep().unwrap(), 1);
        assert_eq!(h.orch.metrics().unwrap().dedup.live_fingerprints, 0);
        assert!(h.store.load_live_fingerprints(t0()).unwrap().is_empty());
    }
}
