//! `QueueService`: the orchestration layer between the raw `JobStore` and
//! everything else (workers, the CLI). This is the only place that knows
//! the job state machine; callers never manipulate store rows directly.

use crate::error::{Error, Result};
use crate::job::{ExecutionRecord, Job, JobId, JobSpec, State};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::store::{JobStore, ListQuery};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub scheduled: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
    pub cancelled: i64,
}

pub struct QueueService {
    store: Arc<dyn JobStore>,
    retry_policy: RetryPolicy,
    metrics: Arc<dyn Metrics>,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobStore>, retry_policy: RetryPolicy, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            store,
            retry_policy,
            metrics,
        }
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        if spec.command.trim().is_empty() {
            return Err(Error::InvalidJobSpec("command must not be empty".to_string()));
        }
        let job = Job::from_spec(spec, Utc::now());
        info!(job_id = %job.id, priority = ?job.priority, state = %job.state, "job enqueued");
        self.store.insert(job).await
    }

    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let claimed = self.store.claim_next(worker_id).await?;
        if let Some(job) = &claimed {
            self.metrics.job_started();
            info!(job_id = %job.id, worker_id, "job claimed");
        }
        Ok(claimed)
    }

    pub async fn complete(
        &self,
        id: JobId,
        expected_version: i64,
        exit_code: Option<i32>,
        output_ref: Option<String>,
    ) -> Result<Job> {
        let job = self.store.get_by_id(id).await?;
        let record = ExecutionRecord {
            attempt: job.attempts + 1,
            worker_id: job.worker_id.clone().unwrap_or_default(),
            started_at: job.started_at.unwrap_or(job.updated_at),
            finished_at: Utc::now(),
            exit_code,
            error: None,
        };
        let completed = self
            .store
            .complete(id, expected_version, exit_code, output_ref, record)
            .await?;
        self.metrics.job_completed();
        info!(job_id = %id, "job completed");
        Ok(completed)
    }

    /// `force_dead` short-circuits retry logic (used for rejected commands,
    /// which should never be retried).
    pub async fn fail(
        &self,
        id: JobId,
        expected_version: i64,
        exit_code: Option<i32>,
        reason: String,
        force_dead: bool,
    ) -> Result<Job> {
        let job = self.store.get_by_id(id).await?;
        let record = ExecutionRecord {
            attempt: job.attempts + 1,
            worker_id: job.worker_id.clone().unwrap_or_default(),
            started_at: job.started_at.unwrap_or(job.updated_at),
            finished_at: Utc::now(),
            exit_code,
            error: Some(reason.clone()),
        };

        if !force_dead && job.should_retry() {
            let delay = self.retry_policy.delay_for(job.attempts);
            let next_run_at = Utc::now() + delay;
            let retried = self
                .store
                .schedule_retry(id, expected_version, next_run_at, record)
                .await?;
            self.metrics.job_retried();
            warn!(job_id = %id, %reason, next_run_at = %next_run_at, "job scheduled for retry");
            Ok(retried)
        } else {
            let dead_reason = if force_dead {
                reason
            } else {
                format!("max retries exceeded: {reason}")
            };
            let dead = self
                .store
                .move_to_dlq(id, expected_version, dead_reason, record)
                .await?;
            self.metrics.job_dead();
            warn!(job_id = %id, "job moved to dead-letter state");
            Ok(dead)
        }
    }

    pub async fn timeout_job(&self, job: &Job) -> Result<Job> {
        self.metrics.job_timed_out();
        self.fail(job.id, job.version, None, "timed out".to_string(), false)
            .await
    }

    pub async fn promote_scheduled(&self) -> Result<u64> {
        self.store.promote_scheduled(Utc::now()).await
    }

    pub async fn reap_timeouts(&self) -> Result<u64> {
        let timed_out = self.store.list_timed_out(Utc::now()).await?;
        let count = timed_out.len() as u64;
        for job in timed_out {
            if let Err(e) = self.timeout_job(&job).await {
                warn!(job_id = %job.id, error = %e, "failed to reap timed-out job");
            }
        }
        Ok(count)
    }

    /// General passthrough to the store's `list_by_state`, for the CLI's
    /// `list`/`status` command and any other caller that needs jobs in a
    /// given state rather than just the dead-letter queue.
    pub async fn list(&self, state: State, query: ListQuery) -> Result<Vec<Job>> {
        self.store.list_by_state(state, query).await
    }

    pub async fn dlq_list(&self, limit: i64) -> Result<Vec<Job>> {
        self.store
            .list_by_state(State::Dead, ListQuery { limit, offset: 0 })
            .await
    }

    pub async fn dlq_retry(
        &self,
        id: JobId,
        reset_attempts: bool,
        new_max_retries: Option<u32>,
    ) -> Result<Job> {
        self.store.dlq_retry(id, reset_attempts, new_max_retries).await
    }

    pub async fn dlq_purge_all(&self) -> Result<u64> {
        self.store.dlq_purge_all().await
    }

    pub async fn dlq_purge_older_than(&self, age: Duration) -> Result<u64> {
        self.store.dlq_purge_older_than(Utc::now() - age).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.store.count_by_state(State::Pending).await?,
            scheduled: self.store.count_by_state(State::Scheduled).await?,
            processing: self.store.count_by_state(State::Processing).await?,
            completed: self.store.count_by_state(State::Completed).await?,
            dead: self.store.count_by_state(State::Dead).await?,
            cancelled: self.store.count_by_state(State::Cancelled).await?,
        })
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get_by_id(id).await
    }

    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        self.store.cancel(id).await
    }

    pub async fn release(&self, id: JobId, worker_id: &str) -> Result<bool> {
        self.store.release(id, worker_id).await
    }

    /// Crash recovery: called once at startup before any worker is spawned.
    pub async fn recover(&self) -> Result<u64> {
        let n = self.store.reset_all_processing().await?;
        if n > 0 {
            info!(count = n, "recovered jobs stuck in processing at startup");
        }
        Ok(n)
    }

    pub async fn reset_worker(&self, worker_id: &str) -> Result<u64> {
        self.store.reset_worker(worker_id).await
    }

    /// Run the `promote_scheduled`/`reap_timeouts` sweepers on fixed
    /// cadences until `shutdown` resolves.
    pub async fn run_sweepers(
        self: Arc<Self>,
        promote_interval: std::time::Duration,
        reap_interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let promote_self = self.clone();
        let mut promote_shutdown = shutdown.clone();
        let promote_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(promote_interval) => {
                        if let Err(e) = promote_self.promote_scheduled().await {
                            warn!(error = %e, "promote_scheduled failed");
                        }
                    }
                    _ = promote_shutdown.changed() => {
                        if *promote_shutdown.borrow() { break; }
                    }
                }
            }
        });

        let reap_self = self;
        let reap_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reap_interval) => {
                        if let Err(e) = reap_self.reap_timeouts().await {
                            warn!(error = %e, "reap_timeouts failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });

        let _ = tokio::join!(promote_task, reap_task);
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}
