//! Mode cadence: which research modes are due, and what work they propose.

use std::collections::HashMap;

use botfleet_core::{JobTrigger, OrchestratorConfig, OrchestratorState, ResearchMode, WorkUnit};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::json;

/// Enabled modes whose interval has elapsed, most overdue first.
///
/// A mode that has never run is due immediately and sorts ahead of the rest.
pub fn due_modes(
    now: DateTime<Utc>,
    state: &OrchestratorState,
    config: &OrchestratorConfig,
) -> Vec<ResearchMode> {
    let mut due: Vec<(bool, Duration, ResearchMode)> = state
        .active_modes()
        .into_iter()
        .filter_map(|mode| match state.last_run_at(mode) {
            None => Some((true, Duration::zero(), mode)),
            Some(last) => {
                let overdue = now - (last + config.interval(mode));
                (overdue >= Duration::zero()).then_some((false, overdue, mode))
            }
        })
        .collect();

    due.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.cmp(&a.1))
            .then(b.2.default_priority().cmp(&a.2.default_priority()))
    });
    due.into_iter().map(|(_, _, mode)| mode).collect()
}

/// Start of the interval-aligned window containing `now`.
pub fn cadence_slot(
    mode: ResearchMode,
    now: DateTime<Utc>,
    config: &OrchestratorConfig,
) -> DateTime<Utc> {
    let interval_secs = config.interval(mode).num_seconds().max(1);
    let ts = now.timestamp();
    let start = ts - ts.rem_euclid(interval_secs);
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}

/// Work a cadence tick proposes for `mode`. One fingerprint per slot.
pub fn cadence_work(
    mode: ResearchMode,
    now: DateTime<Utc>,
    config: &OrchestratorConfig,
) -> WorkUnit {
    let slot = cadence_slot(mode, now, config);
    WorkUnit {
        mode,
        trigger: JobTrigger::Cadence,
        subject: format!("{}@{}", mode, slot.to_rfc3339_opts(SecondsFormat::Secs, true)),
        params: json!({ "intervalMins": config.interval(mode).num_minutes() }),
        priority: mode.default_priority(),
        scheduled_for: Some(now),
    }
}

/// Work for an operator-triggered run. Repeat clicks within a minute collapse.
pub fn manual_work(
    mode: ResearchMode,
    now: DateTime<Utc>,
    config: &OrchestratorConfig,
) -> WorkUnit {
    let minute = DateTime::from_timestamp(now.timestamp() - now.timestamp().rem_euclid(60), 0)
        .unwrap_or(now);
    WorkUnit {
        mode,
        trigger: JobTrigger::Manual,
        subject: format!("{}@manual/{}", mode, minute.to_rfc3339_opts(SecondsFormat::Secs, true)),
        params: json!({}),
        priority: mode.default_priority() + config.manual_priority_boost,
        scheduled_for: Some(now),
    }
}

#[derive(Default)]
struct Memory {
    last_deferred_at: HashMap<ResearchMode, DateTime<Utc>>,
    last_full_spectrum_dispatch: Option<DateTime<Utc>>,
}

/// Tick-to-tick memory the persisted state does not carry:
/// deferral back-off per mode and the Full Spectrum stagger.
#[derive(Default)]
pub struct CadenceController {
    memory: Mutex<Memory>,
}

impl CadenceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modes to submit on this tick.
    pub fn plan(
        &self,
        now: DateTime<Utc>,
        state: &OrchestratorState,
        config: &OrchestratorConfig,
    ) -> Vec<ResearchMode> {
        let memory = self.memory.lock();
        let retry_gap = Duration::seconds(config.deferral_retry_secs);
        let mut modes: Vec<ResearchMode> = due_modes(now, state, config)
            .into_iter()
            .filter(|mode| match memory.last_deferred_at.get(mode) {
                Some(at) => now - *at >= retry_gap,
                None => true,
            })
            .collect();

        if state.is_full_spectrum_enabled {
            if let Some(last) = memory.last_full_spectrum_dispatch {
                if now - last < Duration::seconds(config.stagger_secs) {
                    return Vec::new();
                }
            }
            modes.truncate(1);
        }
        modes
    }

    /// Remember what happened to a cadence submission.
    pub fn record(
        &self,
        mode: ResearchMode,
        deferred: bool,
        full_spectrum: bool,
        now: DateTime<Utc>,
    ) {
        let mut memory = self.memory.lock();
        if deferred {
            memory.last_deferred_at.insert(mode, now);
        } else {
            memory.last_deferred_at.remove(&mode);
        }
        if full_spectrum {
            memory.last_full_spectrum_dispatch = Some(now);
        }
    }

    pub fn clear_deferral(&self, mode: ResearchMode) {
        self.memory.lock().last_deferred_at.remove(&mode);
    }
}
