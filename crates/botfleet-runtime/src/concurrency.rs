//! RUNNING-job ceilings, global and per mode.

use std::collections::HashMap;
use std::sync::Arc;

use botfleet_core::{OrchestratorConfig, ResearchMode};
use parking_lot::Mutex;

use crate::types::{Admission, DeferReason};

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_mode: HashMap<ResearchMode, usize>,
}

pub struct ConcurrencyLimiter {
    counts: Arc<Mutex<Counts>>,
    max_concurrent: usize,
    mode_limits: HashMap<ResearchMode, usize>,
}

impl ConcurrencyLimiter {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let mode_limits = ResearchMode::ALL
            .into_iter()
            .filter_map(|mode| config.mode_limit(mode).map(|limit| (mode, limit)))
            .collect();
        Self {
            counts: Arc::new(Mutex::new(Counts::default())),
            max_concurrent: config.max_concurrent,
            mode_limits,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Whether a job of `mode` could start right now.
    pub fn authorize(&self, mode: ResearchMode) -> Admission {
        let counts = self.counts.lock();
        if self.has_room(&counts, mode) {
            Admission::Allow
        } else {
            Admission::Defer(DeferReason::MaxConcurrent)
        }
    }

    /// Take a slot for `mode`; the slot is held until the permit drops.
    pub fn try_acquire(&self, mode: ResearchMode) -> Result<RunPermit, DeferReason> {
        let mut counts = self.counts.lock();
        if !self.has_room(&counts, mode) {
            return Err(DeferReason::MaxConcurrent);
        }
        counts.total += 1;
        *counts.per_mode.entry(mode).or_insert(0) += 1;
        Ok(RunPermit {
            counts: Arc::clone(&self.counts),
            mode,
        })
    }

    pub fn running(&self) -> usize {
        self.counts.lock().total
    }

    fn has_room(&self, counts: &Counts, mode: ResearchMode) -> bool {
        if counts.total >= self.max_concurrent {
            return false;
        }
        match self.mode_limits.get(&mode) {
            Some(limit) => counts.per_mode.get(&mode).copied().unwrap_or(0) < *limit,
            None => true,
        }
    }
}

/// A held RUNNING slot. Released on drop, whatever terminal state the job reaches.
#[derive(Debug)]
pub struct RunPermit {
    counts: Arc<Mutex<Counts>>,
    mode: ResearchMode,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        counts.total = counts.total.saturating_sub(1);
        if let Some(n) = counts.per_mode.get_mut(&self.mode) {
            *n = n.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn limiter(max: usize, deep_limit: Option<usize>) -> ConcurrencyLimiter {
        let mut mode_limits = BTreeMap::new();
        if let Some(limit) = deep_limit {
            mode_limits.insert("DEEP_REASONING".to_string(), limit);
        }
        ConcurrencyLimiter::new(&OrchestratorConfig {
            max_concurrent: max,
            mode_limits,
            ..Default::default()
        })
    }

    #[test]
    fn test_global_ceiling() {
        let l = limiter(2, None);
        let a = l.try_acquire(ResearchMode::SentimentBurst).unwrap();
        let _b = l.try_acquire(ResearchMode::ContrarianScan).unwrap();
        assert_eq!(l.running(), 2);
        assert_eq!(
            l.authorize(ResearchMode::SentimentBurst),
            Admission::Defer(DeferReason::MaxConcurrent)
        );
        assert!(l.try_acquire(ResearchMode::DeepReasoning).is_err());

        drop(a);
        assert_eq!(l.running(), 1);
        assert!(l.authorize(ResearchMode::DeepReasoning).is_allowed());
    }

    #[test]
    fn test_per_mode_ceiling() {
        let l = limiter(3, Some(1));
        let deep = l.try_acquire(ResearchMode::DeepReasoning).unwrap();
        assert!(l.try_acquire(ResearchMode::DeepReasoning).is_err());
        assert!(l.try_acquire(ResearchMode::SentimentBurst).is_ok());
        drop(deep);
        assert!(l.try_acquire(ResearchMode::DeepReasoning).is_ok());
    }

    #[test]
    fn test_permit_released_on_drop() {
        let l = limiter(1, None);
        {
            let _permit = l.try_acquire(ResearchMode::SentimentBurst).unwrap();
            assert_eq!(l.running(), 1);
        }
        assert_eq!(l.running(), 0);
        assert!(l.authorize(ResearchMode::SentimentBurst).is_allowed());
    }
}
