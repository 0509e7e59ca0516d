//! Configuration and data directory management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{CostClass, ResearchMode};

/// Paths to the orchestrator's data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database directory (`data/db/`).
    pub db_dir: PathBuf,
    /// Orchestrator tuning (`data/orchestrator.json`).
    pub orchestrator_config_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db_dir: root.join("db"),
            orchestrator_config_file: root.join("orchestrator.json"),
            root,
        };
        std::fs::create_dir_all(&paths.db_dir)?;
        Ok(paths)
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    pub orchestrator: OrchestratorConfig,
}

impl FleetConfig {
    /// Create configuration from environment, the data directory and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3010);

        let data_paths = DataPaths::new(data_dir)?;
        let orchestrator = OrchestratorConfig::load(&data_paths.orchestrator_config_file)?;

        Ok(Self {
            port,
            data_paths,
            orchestrator,
        })
    }
}

/// Scheduling, budget, admission and alerting knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Dispatcher tick period.
    pub tick_interval_secs: u64,
    pub sentiment_interval_mins: i64,
    pub contrarian_interval_mins: i64,
    pub deep_reasoning_interval_mins: i64,
    /// Minimum gap between Full Spectrum dispatches.
    pub stagger_secs: i64,
    /// How long a mode waits after a deferral before it is proposed again.
    pub deferral_retry_secs: i64,

    pub daily_budget_usd: f64,
    pub max_daily_jobs: Option<u32>,
    pub cost_low_usd: f64,
    pub cost_medium_usd: f64,
    pub cost_high_usd: f64,
    pub throttle_utilization: f64,
    pub critical_utilization: f64,

    /// Global RUNNING ceiling; also the worker pool size.
    pub max_concurrent: usize,
    /// Optional per-mode RUNNING ceilings, keyed by mode name.
    pub mode_limits: BTreeMap<String, usize>,
    pub max_queue_depth: usize,
    pub manual_priority_boost: i32,

    pub fingerprint_ttl_hours: i64,
    pub fingerprint_max_entries: usize,
    pub sweep_interval_secs: u64,

    pub job_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: i64,

    pub observation_window_mins: i64,
    /// Minutes without a cadence dispatch before the orchestrator counts as
    /// stalled. The default of 15 is shorter than the 30 minute sentiment
    /// cadence, so a Sentiment-only fleet alerts between runs. Set it above
    /// the longest gap expected between dispatches.
    pub stall_threshold_mins: i64,
    pub drift_threshold_mins: i64,
    pub failure_rate_threshold: f64,
    pub backpressure_threshold: usize,

    /// Research provider endpoint; dry-run when unset.
    pub provider_url: Option<String>,
    /// Name of the env var holding the provider bearer token.
    pub provider_auth_token_env: Option<String>,

    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 15,
            sentiment_interval_mins: 30,
            contrarian_interval_mins: 120,
            deep_reasoning_interval_mins: 360,
            stagger_secs: 60,
            deferral_retry_secs: 300,
            daily_budget_usd: 50.0,
            max_daily_jobs: None,
            cost_low_usd: 0.05,
            cost_medium_usd: 0.25,
            cost_high_usd: 1.50,
            throttle_utilization: 0.80,
            critical_utilization: 0.95,
            max_concurrent: 3,
            mode_limits: BTreeMap::new(),
            max_queue_depth: 20,
            manual_priority_boost: 50,
            fingerprint_ttl_hours: 24,
            fingerprint_max_entries: 10_000,
            sweep_interval_secs: 300,
            job_timeout_secs: 600,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            circuit_failure_threshold: 5,
            circuit_cooldown_secs: 300,
            observation_window_mins: 60,
            stall_threshold_mins: 15,
            drift_threshold_mins: 10,
            failure_rate_threshold: 0.30,
            backpressure_threshold: 10,
            provider_url: None,
            provider_auth_token_env: None,
            config_path: PathBuf::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a JSON file (missing file means defaults), then apply env overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut config: OrchestratorConfig = match std::fs::read_to_string(config_path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("{}: {}", config_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No orchestrator config at {}, using defaults",
                    config_path.display()
                );
                OrchestratorConfig::default()
            }
            Err(e) => return Err(Error::Io(e)),
        };
        config.config_path = config_path.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(budget) = env_parse::<f64>("BOTFLEET_DAILY_BUDGET_USD") {
            self.daily_budget_usd = budget;
        }
        if let Some(max) = env_parse::<usize>("BOTFLEET_MAX_CONCURRENT") {
            self.max_concurrent = max;
        }
        if let Ok(url) = std::env::var("BOTFLEET_PROVIDER_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.provider_url = Some(url.to_string());
            }
        }
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.daily_budget_usd > 0.0) {
            return Err(Error::Config("dailyBudgetUsd must be positive".into()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Config("maxConcurrent must be at least 1".into()));
        }
        if self.tick_interval_secs == 0 {
            return Err(Error::Config("tickIntervalSecs must be at least 1".into()));
        }
        if !(self.throttle_utilization < self.critical_utilization) {
            return Err(Error::Config(
                "throttleUtilization must be below criticalUtilization".into(),
            ));
        }
        for mode in ResearchMode::ALL {
            if self.interval(mode) <= chrono::Duration::zero() {
                return Err(Error::Config(format!("interval for {} must be positive", mode)));
            }
        }
        for key in self.mode_limits.keys() {
            key.parse::<ResearchMode>()
                .map_err(|_| Error::Config(format!("modeLimits has unknown mode '{}'", key)))?;
        }
        if self.fingerprint_ttl_hours <= 0 {
            return Err(Error::Config("fingerprintTtlHours must be positive".into()));
        }
        Ok(())
    }

    pub fn interval(&self, mode: ResearchMode) -> chrono::Duration {
        let mins = match mode {
            ResearchMode::SentimentBurst => self.sentiment_interval_mins,
            ResearchMode::ContrarianScan => self.contrarian_interval_mins,
            ResearchMode::DeepReasoning => self.deep_reasoning_interval_mins,
        };
        chrono::Duration::minutes(mins)
    }

    pub fn estimated_cost(&self, cost_class: CostClass) -> f64 {
        match cost_class {
            CostClass::Low => self.cost_low_usd,
            CostClass::Medium => self.cost_medium_usd,
            CostClass::High => self.cost_high_usd,
        }
    }

    pub fn mode_limit(&self, mode: ResearchMode) -> Option<usize> {
        self.mode_limits.iter().find_map(|(key, limit)| {
            match key.parse::<ResearchMode>() {
                Ok(parsed) if parsed == mode => Some(*limit),
                Ok(_) => None,
                Err(_) => {
                    warn!("Ignoring mode limit for unknown mode '{}'", key);
                    None
                }
            }
        })
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn job_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.job_timeout_secs)
    }

    pub fn fingerprint_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.fingerprint_ttl_hours)
    }

    pub fn observation_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.observation_window_mins)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={}", key, raw);
            None
        }
    }
}
