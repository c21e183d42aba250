//! A single worker's claim/execute/report loop.

use crate::executor::CommandExecutor;
use crate::job::JobId;
use crate::metrics::Metrics;
use crate::queue::QueueService;
use crate::security::CommandFilter;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

impl WorkerStats {
    pub fn success_rate(&self) -> f64 {
        if self.jobs_processed == 0 {
            0.0
        } else {
            self.jobs_succeeded as f64 / self.jobs_processed as f64
        }
    }
}

/// One worker. Cheaply `Clone`able: all mutable state lives behind `Arc`,
/// so spawning the run loop on a clone shares state with the handle kept by
/// the pool.
pub struct Worker {
    pub id: String,
    queue: Arc<QueueService>,
    executor: Arc<dyn CommandExecutor>,
    filter: Arc<CommandFilter>,
    metrics: Arc<dyn Metrics>,
    poll_interval: std::time::Duration,
    state: Arc<RwLock<WorkerState>>,
    current_job: Arc<Mutex<Option<JobId>>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Clone for Worker {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            queue: self.queue.clone(),
            executor: self.executor.clone(),
            filter: self.filter.clone(),
            metrics: self.metrics.clone(),
            poll_interval: self.poll_interval,
            state: self.state.clone(),
            current_job: self.current_job.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<QueueService>,
        executor: Arc<dyn CommandExecutor>,
        filter: Arc<CommandFilter>,
        metrics: Arc<dyn Metrics>,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            executor,
            filter,
            metrics,
            poll_interval,
            state: Arc::new(RwLock::new(WorkerState::Starting)),
            current_job: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Spawn the run loop on the current Tokio runtime, returning its handle.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            *self.state.write().await = WorkerState::Running;
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(worker_id = %self.id, "worker started");

        while *self.state.read().await == WorkerState::Running {
            match self.queue.claim_next(&self.id).await {
                Ok(Some(job)) => {
                    *self.current_job.lock().await = Some(job.id);
                    self.process(job).await;
                    *self.current_job.lock().await = None;
                }
                Ok(None) => sleep(self.poll_interval).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim_next failed, retrying");
                    sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
        *self.state.write().await = WorkerState::Stopped;
    }

    async fn process(&self, job: crate::job::Job) {
        info!(worker_id = %self.id, job_id = %job.id, attempt = job.attempts, "processing job");

        if let Err(reason) = self.filter.check(&job.command) {
            warn!(worker_id = %self.id, job_id = %job.id, %reason, "command rejected");
            if let Err(e) = self
                .queue
                .fail(job.id, job.version, None, format!("command rejected: {reason}"), true)
                .await
            {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "failed to record rejection");
            }
            self.bump(false).await;
            return;
        }

        let outcome = self.executor.execute(&job.command, job.timeout).await;

        let result = if outcome.success {
            self.queue
                .complete(job.id, job.version, outcome.exit_code, outcome.output_ref)
                .await
        } else {
            self.queue
                .fail(
                    job.id,
                    job.version,
                    outcome.exit_code,
                    outcome.error.unwrap_or_else(|| "unknown error".to_string()),
                    false,
                )
                .await
        };

        match result {
            Ok(_) => self.bump(outcome.success).await,
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "failed to report outcome");
                self.bump(false).await;
            }
        }
    }

    async fn bump(&self, succeeded: bool) {
        let mut s = self.stats.lock().await;
        s.jobs_processed += 1;
        if succeeded {
            s.jobs_succeeded += 1;
        } else {
            s.jobs_failed += 1;
        }
    }

    pub async fn stats(&self) -> WorkerStats {
        *self.stats.lock().await
    }

    pub async fn current_job(&self) -> Option<JobId> {
        *self.current_job.lock().await
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Signal the run loop to stop after its current iteration. Does not
    /// wait for an in-flight job; the pool's graceful shutdown does that.
    pub async fn stop(&self) {
        *self.state.write().await = WorkerState::Stopping;
    }
}
