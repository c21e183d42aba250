//! The `JobStore` trait: the atomic contract every backend (Postgres, or the
//! in-memory store used in tests) must honor so the rest of the system can
//! stay race-free without knowing which backend it's talking to.

use crate::error::Result;
use crate::job::{Job, JobId, State};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of a claim attempt: either the winning job, or nothing eligible.
pub type ClaimOutcome = Option<Job>;

/// Pagination/filtering for `list_by_state`.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `Error::DuplicateId` if `job.id` exists.
    async fn insert(&self, job: Job) -> Result<Job>;

    async fn get_by_id(&self, id: JobId) -> Result<Job>;

    async fn count_by_state(&self, state: State) -> Result<i64>;

    async fn count_all(&self) -> Result<i64>;

    async fn list_by_state(&self, state: State, query: ListQuery) -> Result<Vec<Job>>;

    /// Atomically claim the next eligible job for `worker_id`: the highest
    /// priority, oldest-first `Pending` job whose `run_at` has arrived.
    /// Returns `None` if nothing is eligible. See the crate docs for the
    /// exact five-step protocol this implements.
    async fn claim_next(&self, worker_id: &str) -> Result<ClaimOutcome>;

    /// Return a `Processing` job owned by `worker_id` back to `Pending`,
    /// clearing claim fields. Returns `false` if the job wasn't owned by
    /// `worker_id` in `Processing` state.
    async fn release(&self, id: JobId, worker_id: &str) -> Result<bool>;

    /// Mark a job completed. Fails with `Error::VersionConflict` if
    /// `expected_version` doesn't match.
    async fn complete(
        &self,
        id: JobId,
        expected_version: i64,
        exit_code: Option<i32>,
        output_ref: Option<String>,
        record: crate::job::ExecutionRecord,
    ) -> Result<Job>;

    /// Reschedule a job for retry: `Pending`, future `run_at`, `attempts += 1`,
    /// claim fields cleared, in one atomic step.
    async fn schedule_retry(
        &self,
        id: JobId,
        expected_version: i64,
        next_run_at: DateTime<Utc>,
        record: crate::job::ExecutionRecord,
    ) -> Result<Job>;

    /// Move a job to the terminal `Dead` state with a reason.
    async fn move_to_dlq(
        &self,
        id: JobId,
        expected_version: i64,
        reason: String,
        record: crate::job::ExecutionRecord,
    ) -> Result<Job>;

    /// Retry a dead-lettered job: back to `Pending`, optionally resetting
    /// `attempts` and/or `max_retries`.
    async fn dlq_retry(
        &self,
        id: JobId,
        reset_attempts: bool,
        new_max_retries: Option<u32>,
    ) -> Result<Job>;

    async fn dlq_purge_all(&self) -> Result<u64>;

    async fn dlq_purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// `Scheduled` jobs whose `run_at` has arrived become `Pending`.
    /// Returns the number promoted.
    async fn promote_scheduled(&self, now: DateTime<Utc>) -> Result<u64>;

    /// `Processing` jobs whose `deadline_at` has passed. Returns them so the
    /// caller (`QueueService::reap_timeouts`) can route each through the
    /// normal failure path.
    async fn list_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Crash recovery: every `Processing` row becomes `Pending` again,
    /// claim fields cleared. Idempotent. Returns the number reset.
    async fn reset_all_processing(&self) -> Result<u64>;

    /// Reset every job claimed by `worker_id` back to `Pending`, used when a
    /// worker exits (gracefully or otherwise). Returns the number reset.
    async fn reset_worker(&self, worker_id: &str) -> Result<u64>;

    async fn cancel(&self, id: JobId) -> Result<Job>;
}
