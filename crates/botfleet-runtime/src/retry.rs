//! Provider failure handling: exponential backoff and a circuit breaker.

use std::time::Duration;

use botfleet_core::OrchestratorConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::types::{Admission, CircuitState, DeferReason};

/// Retry schedule for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first call.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Backoff for `attempt`, stretched to a provider-requested wait when
    /// longer. Never exceeds `max`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff_delay(attempt);
        match retry_after {
            Some(wait) => wait.max(backoff).min(self.max),
            None => backoff,
        }
    }

    pub fn is_exhausted(&self, retries_so_far: u32) -> bool {
        retries_so_far >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(1_000),
            max: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Closed,
    Open { since: DateTime<Utc> },
    HalfOpen { trial_in_flight: bool },
}

struct Breaker {
    phase: Phase,
    consecutive_failures: u32,
}

/// Opens after a run of failed provider calls; lets one trial call through after a cooldown.
pub struct CircuitBreaker {
    inner: Mutex<Breaker>,
    failure_threshold: u32,
    cooldown: chrono::Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: chrono::Duration) -> Self {
        Self {
            inner: Mutex::new(Breaker {
                phase: Phase::Closed,
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            chrono::Duration::seconds(config.circuit_cooldown_secs),
        )
    }

    /// Admission check for new work. Does not change state.
    pub fn authorize(&self, now: DateTime<Utc>) -> Admission {
        let inner = self.inner.lock();
        let allowed = match inner.phase {
            Phase::Closed => true,
            Phase::Open { since } => now - since >= self.cooldown,
            Phase::HalfOpen { trial_in_flight } => !trial_in_flight,
        };
        if allowed {
            Admission::Allow
        } else {
            Admission::Defer(DeferReason::CircuitOpen)
        }
    }

    /// Claim the right to call the provider. After the cooldown the first
    /// caller makes the half-open trial call and everyone else is refused.
    pub fn try_begin_call(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => true,
            Phase::Open { since } if now - since >= self.cooldown => {
                info!("Provider circuit half-open, sending trial call");
                inner.phase = Phase::HalfOpen { trial_in_flight: true };
                true
            }
            Phase::Open { .. } => false,
            Phase::HalfOpen { trial_in_flight: false } => {
                inner.phase = Phase::HalfOpen { trial_in_flight: true };
                true
            }
            Phase::HalfOpen { trial_in_flight: true } => false,
        }
    }

    /// Give back a call slot from [`try_begin_call`](Self::try_begin_call)
    /// that never reached the provider.
    pub fn abandon_call(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == (Phase::HalfOpen { trial_in_flight: true }) {
            inner.phase = Phase::HalfOpen { trial_in_flight: false };
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Closed {
            info!("Provider circuit closed");
        }
        inner.phase = Phase::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.phase {
            Phase::Closed => inner.consecutive_failures >= self.failure_threshold,
            Phase::HalfOpen { .. } => true,
            Phase::Open { .. } => false,
        };
        if trip {
            warn!(
                "Provider circuit opened after {} consecutive failures",
                inner.consecutive_failures
            );
            inner.phase = Phase::Open { since: now };
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.lock().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}
