//! Bounded, TTL'd dedup map of work fingerprints.
//!
//! The map is the source of truth at runtime. Callers write the returned
//! records through to storage and delete whatever was evicted or swept.

use std::collections::HashMap;

use botfleet_core::CandidateFingerprint;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::types::DedupStats;

/// Outcome of [`FingerprintStore::check_and_record`].
#[derive(Debug, Clone, PartialEq)]
pub struct DedupCheck {
    pub is_duplicate: bool,
    pub hit_count: u32,
    /// Current record, to be persisted.
    pub record: CandidateFingerprint,
    /// Hashes dropped to stay under the entry cap.
    pub evicted: Vec<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CandidateFingerprint>,
    total_submissions: u64,
    duplicates_blocked: u64,
}

pub struct FingerprintStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
}

impl FingerprintStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Seed the map with records loaded from storage.
    pub fn with_entries(
        ttl: Duration,
        max_entries: usize,
        entries: impl IntoIterator<Item = CandidateFingerprint>,
    ) -> Self {
        let store = Self::new(ttl, max_entries);
        {
            let mut inner = store.inner.lock();
            for fp in entries {
                inner.entries.insert(fp.fingerprint_hash.clone(), fp);
            }
        }
        store
    }

    /// Record a sighting of `hash` and report whether it was already live.
    pub fn check_and_record(&self, hash: &str, now: DateTime<Utc>) -> DedupCheck {
        let mut inner = self.inner.lock();
        inner.total_submissions += 1;

        if let Some(existing) = inner.entries.get_mut(hash) {
            if !existing.is_expired(now) {
                existing.hit_count = existing.hit_count.saturating_add(1);
                existing.last_seen_at = now;
                let record = existing.clone();
                inner.duplicates_blocked += 1;
                return DedupCheck {
                    is_duplicate: true,
                    hit_count: record.hit_count,
                    record,
                    evicted: Vec::new(),
                };
            }
        }

        let record = CandidateFingerprint {
            fingerprint_hash: hash.to_string(),
            hit_count: 1,
            created_at: now,
            last_seen_at: now,
            expires_at: now + self.ttl,
        };
        inner.entries.insert(hash.to_string(), record.clone());
        let evicted = self.enforce_cap(&mut inner, now, hash);

        DedupCheck {
            is_duplicate: false,
            hit_count: 1,
            record,
            evicted,
        }
    }

    /// Drop `hash` so the same work can be proposed again.
    pub fn forget(&self, hash: &str) -> bool {
        self.inner.lock().entries.remove(hash).is_some()
    }

    /// Purge expired entries, returning their hashes.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|fp| fp.is_expired(now))
            .map(|fp| fp.fingerprint_hash.clone())
            .collect();
        for hash in &expired {
            inner.entries.remove(hash);
        }
        if !expired.is_empty() {
            debug!("Swept {} expired fingerprints", expired.len());
        }
        expired
    }

    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock();
        let efficiency = if inner.total_submissions == 0 {
            0.0
        } else {
            inner.duplicates_blocked as f64 / inner.total_submissions as f64
        };
        DedupStats {
            total_submissions: inner.total_submissions,
            duplicates_blocked: inner.duplicates_blocked,
            efficiency,
            live_fingerprints: inner.entries.len(),
        }
    }

    /// Expired entries go first, then the soonest to expire. `keep` is never evicted.
    fn enforce_cap(&self, inner: &mut Inner, now: DateTime<Utc>, keep: &str) -> Vec<String> {
        if inner.entries.len() <= self.max_entries {
            return Vec::new();
        }
        let mut candidates: Vec<(bool, DateTime<Utc>, String)> = inner
            .entries
            .values()
            .filter(|fp| fp.fingerprint_hash != keep)
            .map(|fp| (!fp.is_expired(now), fp.expires_at, fp.fingerprint_hash.clone()))
            .collect();
        candidates.sort();

        let excess = inner.entries.len() - self.max_entries;
        let evicted: Vec<String> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, _, hash)| hash)
            .collect();
        for hash in &evicted {
            inner.entries.remove(hash);
        }
        debug!("Evicted {} fingerprints over cap {}", evicted.len(), self.max_entries);
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_hit_counts_across_expiry() {
        let store = FingerprintStore::new(Duration::hours(1), 100);

        let first = store.check_and_record("abc", at(10, 0));
        assert!(!first.is_duplicate);
        assert_eq!(first.hit_count, 1);
        assert_eq!(first.record.expires_at, at(11, 0));

        let second = store.check_and_record("abc", at(10, 30));
        assert!(second.is_duplicate);
        assert_eq!(second.hit_count, 2);
        assert_eq!(second.record.last_seen_at, at(10, 30));
        // A repeat sighting does not extend the window.
        assert_eq!(second.record.expires_at, at(11, 0));

        let third = store.check_and_record("abc", at(11, 0));
        assert!(!third.is_duplicate);
        assert_eq!(third.hit_count, 1);
        assert_eq!(third.record.created_at, at(11, 0));
    }

    #[test]
    fn test_efficiency() {
        let store = FingerprintStore::new(Duration::hours(24), 100);
        store.check_and_record("a", at(9, 0));
        store.check_and_record("a", at(9, 1));
        store.check_and_record("b", at(9, 2));
        store.check_and_record("a", at(9, 3));

        let stats = store.stats();
        assert_eq!(stats.total_submissions, 4);
        assert_eq!(stats.duplicates_blocked, 2);
        assert!((stats.efficiency - 0.5).abs() < 1e-9);
        assert_eq!(stats.live_fingerprints, 2);
    }

    #[test]
    fn test_sweep_and_forget() {
        let store = FingerprintStore::new(Duration::minutes(30), 100);
        store.check_and_record("old", at(9, 0));
        store.check_and_record("new", at(9, 45));

        let swept = store.sweep(at(10, 0));
        assert_eq!(swept, vec!["old".to_string()]);
        assert_eq!(store.stats().live_fingerprints, 1);

        assert!(store.forget("new"));
        assert!(!store.forget("new"));
        assert!(!store.check_and_record("new", at(10, 1)).is_duplicate);
    }

    #[test]
    fn test_cap_evicts_soonest_expiring() {
        let store = FingerprintStore::new(Duration::hours(1), 2);
        store.check_and_record("a", at(9, 0));
        store.check_and_record("b", at(9, 10));
        let check = store.check_and_record("c", at(9, 20));

        assert_eq!(check.evicted, vec!["a".to_string()]);
        assert_eq!(store.stats().live_fingerprints, 2);
        assert!(store.check_and_record("b", at(9, 25)).is_duplicate);
    }

    #[test]
    fn test_seeded_entries_are_live() {
        let seeded = CandidateFingerprint {
            fingerprint_hash: "seed".into(),
            hit_count: 3,
            created_at: at(8, 0),
            last_seen_at: at(8, 30),
            expires_at: at(12, 0),
        };
        let store = FingerprintStore::with_entries(Duration::hours(4), 10, vec![seeded]);
        let check = store.check_and_record("seed", at(9, 0));
        assert!(check.is_duplicate);
        assert_eq!(check.hit_count, 4);
    }
}
