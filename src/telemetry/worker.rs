//! Log worker pool
//!
//! Pulls jobs from the durable queue and persists each one as a
//! [`LogRecord`](super::LogRecord). The worker shares nothing with the
//! request path except the queue: it can stall or crash without affecting
//! gateway responses.
//!
//! - concurrency is bounded by a semaphore
//! - throughput is bounded by a `governor` direct limiter
//! - a failed persist is retried with exponential backoff, then moved to the
//!   failed set with its last error
//! - undecodable or invalid drafts fail immediately

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::LogDraft;
use crate::config::LogPipelineConfig;
use crate::queue::{Job, JobQueue};
use crate::store::LogStore;

type ThroughputLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How a job was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Persisted and acknowledged
    Completed,
    /// Scheduled for another attempt
    Retried,
    /// Moved to the failed set
    Failed,
}

/// Counters since start
#[derive(Debug, Default)]
struct WorkerCounters {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Jobs persisted
    pub completed: u64,
    /// Retries scheduled
    pub retried: u64,
    /// Jobs moved to the failed set
    pub failed: u64,
}

/// Consumer of the traffic log queue
pub struct LogWorker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn LogStore>,
    config: LogPipelineConfig,
    permits: Arc<Semaphore>,
    limiter: ThroughputLimiter,
    counters: WorkerCounters,
}

impl LogWorker {
    /// Create a worker over `queue` persisting into `store`
    #[must_use]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn LogStore>,
        config: &LogPipelineConfig,
    ) -> Self {
        let per_second = NonZeroU32::new(config.max_jobs_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            queue,
            store,
            config: config.clone(),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            counters: WorkerCounters::default(),
        }
    }

    /// Counters since start
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        ExponentialBuilder::default()
            .with_min_delay(self.config.initial_backoff)
            .with_factor(2.0)
            .with_max_delay(Duration::from_secs(24 * 60 * 60))
            .with_max_times(index + 1)
            .build()
            .nth(index)
            .unwrap_or(self.config.initial_backoff)
    }

    /// Run the worker in the background until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let prune_rx = shutdown.subscribe();
        let run_rx = shutdown.subscribe();

        let pruner = Arc::clone(&self);
        tokio::spawn(async move { pruner.prune_loop(prune_rx).await });
        tokio::spawn(async move { self.run(run_rx).await })
    }

    /// Reserve and process jobs until `shutdown` fires, then wait for
    /// in-flight jobs
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            concurrency = self.config.concurrency,
            max_jobs_per_second = self.config.max_jobs_per_second,
            max_attempts = self.config.max_attempts,
            "Log worker started"
        );
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Log job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Not raced against shutdown: a reserve must not be dropped mid-flight
            match self.queue.reserve(self.config.poll_interval).await {
                Ok(Some(job)) => {
                    self.limiter.until_ready().await;
                    let worker = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process(job).await;
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to reserve log job");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }

            if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                break;
            }
        }

        info!(in_flight = in_flight.len(), "Log worker stopping");
        while in_flight.join_next().await.is_some() {}
        let stats = self.stats();
        info!(
            completed = stats.completed,
            retried = stats.retried,
            failed = stats.failed,
            "Log worker stopped"
        );
    }

    /// Process and settle a single job
    pub async fn process(&self, job: Job) -> JobOutcome {
        let draft: LogDraft = match serde_json::from_str(&job.payload) {
            Ok(draft) => draft,
            Err(e) => return self.fail(&job, &format!("undecodable log draft: {e}")).await,
        };
        let record = match draft.validate() {
            Ok(record) => record,
            Err(e) => return self.fail(&job, &e.to_string()).await,
        };

        match self.store.create(&record).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&job).await {
                    warn!(job = %job.id, error = %e, "Failed to acknowledge log job");
                }
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    job = %job.id,
                    method = %record.method,
                    path = %record.path,
                    status = record.status_code,
                    "Log persisted"
                );
                JobOutcome::Completed
            }
            Err(e) => {
                let attempt = job.attempts + 1;
                if attempt >= self.config.max_attempts {
                    return self.fail(&job, &e.to_string()).await;
                }
                let delay = self.backoff_delay(attempt);
                warn!(
                    job = %job.id,
                    attempt,
                    retry_in_ms = delay.as_millis(),
                    error = %e,
                    "Failed to persist log, retrying"
                );
                if let Err(e) = self.queue.retry(&job, delay).await {
                    warn!(job = %job.id, error = %e, "Failed to schedule log job retry");
                }
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                JobOutcome::Retried
            }
        }
    }

    async fn fail(&self, job: &Job, reason: &str) -> JobOutcome {
        error!(job = %job.id, attempts = job.attempts + 1, reason, "Log job failed");
        if let Err(e) = self.queue.fail(job, reason).await {
            warn!(job = %job.id, error = %e, "Failed to move log job to failed set");
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        JobOutcome::Failed
    }

    /// Drop failed jobs past their retention on every interval tick
    async fn prune_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.prune_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.queue.prune(self.config.failed_retention).await {
                        Ok(0) => {}
                        Ok(pruned) => debug!(pruned, "Pruned expired failed log jobs"),
                        Err(e) => warn!(error = %e, "Failed to prune failed log jobs"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}
