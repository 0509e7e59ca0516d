//! Health evaluation and the alert lifecycle.
//!
//! Conditions are recomputed from live metrics on every tick. At most one
//! open alert exists per type. An acknowledged alert stays quiet until its
//! condition clears; an unacknowledged one stays open (marked resolved) until
//! someone acknowledges it.

use std::collections::HashMap;

use botfleet_core::{Alert, AlertSeverity, AlertType, Error, OrchestratorConfig, Result};
use botfleet_store::JobCounts;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Inputs for one health evaluation.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub now: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Latest dispatch among the active modes.
    pub last_dispatch_at: Option<DateTime<Utc>>,
    /// False when no mode is enabled and nothing is expected to dispatch.
    pub any_mode_active: bool,
    pub budget_utilization: f64,
    /// Job counts over the observation window.
    pub window: JobCounts,
    pub oldest_queued_scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    pub stall: Duration,
    pub drift: Duration,
    pub failure_rate: f64,
    pub backpressure: usize,
    pub throttle_utilization: f64,
    pub critical_utilization: f64,
    pub window_mins: i64,
}

impl AlertThresholds {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            stall: Duration::minutes(config.stall_threshold_mins),
            drift: Duration::minutes(config.drift_threshold_mins),
            failure_rate: config.failure_rate_threshold,
            backpressure: config.backpressure_threshold,
            throttle_utilization: config.throttle_utilization,
            critical_utilization: config.critical_utilization,
            window_mins: config.observation_window_mins,
        }
    }
}

/// A condition that currently holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
}

/// `(failed + timeout) / (completed + failed + timeout)`, or `None` with nothing finished.
pub fn failure_rate(counts: &JobCounts) -> Option<f64> {
    let failures = counts.failed + counts.timeout;
    let finished = counts.completed + failures;
    if finished == 0 {
        None
    } else {
        Some(failures as f64 / finished as f64)
    }
}

pub fn evaluate_conditions(
    metrics: &HealthMetrics,
    thresholds: &AlertThresholds,
) -> Vec<Condition> {
    let mut conditions = Vec::new();
    let now = metrics.now;

    if metrics.any_mode_active {
        let since = metrics.last_dispatch_at.unwrap_or(metrics.started_at);
        let idle = now - since;
        if idle > thresholds.stall {
            conditions.push(Condition {
                alert_type: AlertType::OrchestratorStalled,
                severity: AlertSeverity::Critical,
                message: format!("No research dispatched for {} min", idle.num_minutes()),
            });
        }
    }

    let utilization = metrics.budget_utilization;
    if utilization >= thresholds.throttle_utilization {
        let severity = if utilization >= thresholds.critical_utilization {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        conditions.push(Condition {
            alert_type: AlertType::BudgetThrottled,
            severity,
            message: format!("Daily budget {:.0}% used", utilization * 100.0),
        });
    }

    if let Some(rate) = failure_rate(&metrics.window) {
        if rate > thresholds.failure_rate {
            let failures = metrics.window.failed + metrics.window.timeout;
            conditions.push(Condition {
                alert_type: AlertType::HighFailureRate,
                severity: AlertSeverity::Warning,
                message: format!(
                    "Failure rate {:.0}% over last {} min ({} failed of {})",
                    rate * 100.0,
                    thresholds.window_mins,
                    failures,
                    failures + metrics.window.completed
                ),
            });
        }
    }

    if metrics.window.deferred >= thresholds.backpressure {
        conditions.push(Condition {
            alert_type: AlertType::BackpressureBuilding,
            severity: AlertSeverity::Warning,
            message: format!(
                "{} jobs deferred in last {} min",
                metrics.window.deferred, thresholds.window_mins
            ),
        });
    }

    if let Some(scheduled_for) = metrics.oldest_queued_scheduled_for {
        let lag = now - scheduled_for;
        if lag > thresholds.drift {
            conditions.push(Condition {
                alert_type: AlertType::SchedulingDrift,
                severity: AlertSeverity::Warning,
                message: format!("Queued job waiting {} min past its schedule", lag.num_minutes()),
            });
        }
    }

    conditions
}

/// Tracks open alerts, one per type.
pub struct AlertEngine {
    open: Mutex<HashMap<AlertType, Alert>>,
}

impl AlertEngine {
    /// Resume from persisted open alerts.
    pub fn new(existing: impl IntoIterator<Item = Alert>) -> Self {
        let mut open = HashMap::new();
        for alert in existing.into_iter().filter(Alert::is_open) {
            // Keep the newest when storage holds more than one per type.
            let newer = open
                .get(&alert.alert_type)
                .map_or(true, |current: &Alert| alert.created_at > current.created_at);
            if newer {
                open.insert(alert.alert_type, alert);
            }
        }
        Self {
            open: Mutex::new(open),
        }
    }

    /// Apply the current conditions. Returns every alert whose row changed.
    pub fn apply(&self, conditions: &[Condition], now: DateTime<Utc>) -> Vec<Alert> {
        let mut open = self.open.lock();
        let mut changed = Vec::new();

        for alert_type in AlertType::ALL {
            let condition = conditions.iter().find(|c| c.alert_type == alert_type);
            match (condition, open.remove(&alert_type)) {
                (Some(condition), None) => {
                    let alert = raise(condition, now);
                    changed.push(alert.clone());
                    open.insert(alert_type, alert);
                }
                (Some(condition), Some(mut alert)) if alert.acknowledged => {
                    if condition.severity > alert.severity {
                        // Escalation past an acknowledgement is a new incident.
                        alert.resolved_at = Some(now);
                        changed.push(alert);
                        let fresh = raise(condition, now);
                        changed.push(fresh.clone());
                        open.insert(alert_type, fresh);
                    } else {
                        open.insert(alert_type, alert);
                    }
                }
                (Some(condition), Some(mut alert)) => {
                    let mut dirty = false;
                    if alert.resolved_at.take().is_some() {
                        dirty = true;
                    }
                    if alert.severity != condition.severity {
                        alert.severity = condition.severity;
                        alert.message = condition.message.clone();
                        dirty = true;
                    }
                    if dirty {
                        changed.push(alert.clone());
                    }
                    open.insert(alert_type, alert);
                }
                (None, Some(mut alert)) if alert.acknowledged => {
                    info!("Alert {} cleared", alert_type.as_str());
                    alert.resolved_at = Some(now);
                    changed.push(alert);
                }
                (None, Some(mut alert)) => {
                    if alert.resolved_at.is_none() {
                        alert.resolved_at = Some(now);
                        changed.push(alert.clone());
                    }
                    open.insert(alert_type, alert);
                }
                (None, None) => {}
            }
        }
        changed
    }

    /// Acknowledge an open alert. Acknowledging a resolved alert closes it.
    pub fn acknowledge(&self, alert_id: &str, now: DateTime<Utc>) -> Result<Alert> {
        let mut open = self.open.lock();
        let alert_type = open
            .values()
            .find(|a| a.id == alert_id)
            .map(|a| a.alert_type)
            .ok_or_else(|| Error::NotFound(format!("open alert {}", alert_id)))?;

        let Some(alert) = open.get_mut(&alert_type) else {
            return Err(Error::NotFound(format!("open alert {}", alert_id)));
        };
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_at = Some(now);
            info!("Alert {} acknowledged", alert_type.as_str());
        }
        let alert = alert.clone();
        if !alert.is_open() {
            open.remove(&alert_type);
        }
        Ok(alert)
    }

    /// Open alerts, most severe first.
    pub fn open_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.open.lock().values().cloned().collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.created_at.cmp(&a.created_at))
        });
        alerts
    }
}

fn raise(condition: &Condition, now: DateTime<Utc>) -> Alert {
    match condition.severity {
        AlertSeverity::Critical => warn!("Alert raised: {}", condition.message),
        _ => info!("Alert raised: {}", condition.message),
    }
    Alert {
        id: uuid::Uuid::new_v4().to_string(),
        alert_type: condition.alert_type,
        severity: condition.severity,
        message: condition.message.clone(),
        acknowledged: false,
        acknowledged_at: None,
        created_at: now,
        resolved_at: None,
    }
}
