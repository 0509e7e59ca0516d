//! In-memory priority queue of QUEUED jobs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use botfleet_core::ResearchJob;
use chrono::{DateTime, Utc};

struct Entry {
    seq: u64,
    job: ResearchJob,
}

impl Entry {
    /// Higher priority first, then earlier `scheduled_for`, then insertion order.
    fn rank(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.scheduled_for.cmp(&self.job.scheduled_for))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

#[derive(Default)]
pub struct JobQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: ResearchJob) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { seq, job });
    }

    pub fn pop(&mut self) -> Option<ResearchJob> {
        self.heap.pop().map(|entry| entry.job)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Earliest `scheduled_for` among waiting jobs.
    pub fn oldest_scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.heap.iter().map(|entry| entry.job.scheduled_for).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_core::{JobTrigger, ResearchMode, WorkUnit};
    use chrono::{Duration, TimeZone};

    fn job(id: &str, priority: i32, scheduled_min: i64) -> ResearchJob {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let work = WorkUnit {
            mode: ResearchMode::SentimentBurst,
            trigger: JobTrigger::Api,
            subject: id.into(),
            params: serde_json::Value::Null,
            priority,
            scheduled_for: Some(base + Duration::minutes(scheduled_min)),
        };
        ResearchJob::queued(id.into(), &work, 0.05, base)
    }

    #[test]
    fn test_priority_then_schedule_then_fifo() {
        let mut queue = JobQueue::new();
        queue.push(job("late-low", 10, 5));
        queue.push(job("early-low", 10, 0));
        queue.push(job("high", 30, 9));
        queue.push(job("early-low-2", 10, 0));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop()).map(|j| j.id).collect();
        assert_eq!(order, vec!["high", "early-low", "early-low-2", "late-low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oldest_scheduled_for() {
        let mut queue = JobQueue::new();
        assert_eq!(queue.oldest_scheduled_for(), None);
        queue.push(job("a", 50, 7));
        queue.push(job("b", 10, 2));
        assert_eq!(
            queue.oldest_scheduled_for(),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 0).unwrap())
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|j| j.id), Some("a".to_string()));
    }
}
