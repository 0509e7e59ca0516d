//! Background tasks: one dispatcher on a fixed tick, N workers draining the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;
use crate::provider::ResearchProvider;

/// Running dispatcher and worker tasks.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the dispatcher and `max_concurrent` workers.
    pub fn start(orchestrator: Arc<Orchestrator>, provider: Arc<dyn ResearchProvider>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = orchestrator.config().max_concurrent;

        let mut handles = Vec::with_capacity(workers + 1);
        handles.push(tokio::spawn(run_dispatcher(
            orchestrator.clone(),
            shutdown_rx.clone(),
        )));
        for worker_id in 0..workers {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                orchestrator.clone(),
                provider.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(
            "Scheduler started: tick={}s, {} workers, provider={}",
            orchestrator.config().tick_interval_secs,
            workers,
            provider.name()
        );

        Self {
            orchestrator,
            shutdown_tx,
            handles,
        }
    }

    /// Stop dispatching, let in-flight jobs finish, then flush state.
    pub async fn shutdown(self) {
        info!("Scheduler shutting down");
        let _ = self.shutdown_tx.send(true);
        self.orchestrator.work_available().notify_waiters();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Scheduler task panicked: {}", e);
            }
        }
        if let Err(e) = self.orchestrator.flush() {
            error!("Failed to flush orchestrator state: {}", e);
        }
        info!("Scheduler stopped");
    }
}

async fn run_dispatcher(orchestrator: Arc<Orchestrator>, mut shutdown: watch::Receiver<bool>) {
    let config = orchestrator.config();
    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));
    let mut last_sweep = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match orchestrator.tick() {
            Ok(report) => {
                if !report.queued.is_empty() {
                    debug!("Dispatched {:?}", report.queued);
                }
            }
            Err(e) => error!("Scheduler tick failed: {}", e),
        }
        if let Err(e) = orchestrator.evaluate_alerts() {
            error!("Alert evaluation failed: {}", e);
        }
        if last_sweep.elapsed() >= sweep_every {
            last_sweep = tokio::time::Instant::now();
            if let Err(e) = orchestrator.sweep() {
                error!("Fingerprint sweep failed: {}", e);
            }
        }
    }
    debug!("Dispatcher stopped");
}

async fn run_worker(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    provider: Arc<dyn ResearchProvider>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Register interest before checking the queue so a push in between is not missed.
        let notified = orchestrator.work_available().notified();
        match orchestrator.claim_next() {
            Ok(Some(claimed)) => {
                debug!("Worker {} picked up job {}", worker_id, claimed.job.id);
                if let Err(e) = orchestrator.execute(claimed, provider.as_ref()).await {
                    error!("Worker {} failed to record job outcome: {}", worker_id, e);
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!("Worker {} failed to claim a job: {}", worker_id, e),
        }

        tokio::select! {
            _ = notified => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            // Wake periodically in case a notification was consumed by another worker.
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
    debug!("Worker {} stopped", worker_id);
}
