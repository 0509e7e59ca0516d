//! Research job orchestrator.
//!
//! Decides which research modes are due, gates them through budget,
//! concurrency and provider-health admission control, deduplicates the
//! resulting work by content fingerprint, and runs admitted jobs on a
//! bounded worker pool. Health is summarised into acknowledgeable alerts.

pub mod alerts;
pub mod backpressure;
pub mod budget;
pub mod cadence;
pub mod concurrency;
pub mod fingerprint;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use orchestrator::Orchestrator;
pub use provider::{create_provider, ProviderError, ProviderOutput, ResearchProvider};
pub use scheduler::Scheduler;
pub use types::*;
