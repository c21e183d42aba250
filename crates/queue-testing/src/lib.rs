//! An in-memory `JobStore`, so the deterministic concurrency and scenario
//! tests in `queue-core` (and anyone else's integration tests) can run
//! without a live Postgres instance. Mirrors the atomicity guarantees of
//! `queue-postgres`'s `PgJobStore` by holding a single mutex across the
//! read-select-write sequence of every operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::error::{Error, Result};
use queue_core::job::{ExecutionRecord, Job, JobId, State};
use queue_core::store::{JobStore, ListQuery};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::DuplicateId(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Job> {
        let jobs = self.jobs.lock().await;
        jobs.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn count_by_state(&self, state: State) -> Result<i64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.values().filter(|j| j.state == state).count() as i64)
    }

    async fn count_all(&self) -> Result<i64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.len() as i64)
    }

    async fn list_by_state(&self, state: State, query: ListQuery) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs.values().filter(|j| j.state == state).cloned().collect();
        matching.sort_by_key(|j| j.created_at);
        let offset = query.offset.max(0) as usize;
        let limit = if query.limit > 0 { query.limit as usize } else { matching.len() };
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let winner_id = jobs
            .values()
            .filter(|j| j.state == State::Pending && j.run_at.map(|t| t <= now).unwrap_or(true))
            .min_by(|a, b| {
                b.priority
                    .weight()
                    .cmp(&a.priority.weight())
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        let Some(id) = winner_id else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("winner id came from this map");
        job.state = State::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.started_at = Some(now);
        job.deadline_at = Some(now + job.timeout);
        job.version += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn release(&self, id: JobId, worker_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != State::Processing || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.state = State::Pending;
        job.worker_id = None;
        job.claimed_at = None;
        job.started_at = None;
        job.deadline_at = None;
        job.version += 1;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(
        &self,
        id: JobId,
        expected_version: i64,
        exit_code: Option<i32>,
        output_ref: Option<String>,
        record: ExecutionRecord,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        if job.version != expected_version {
            return Err(Error::VersionConflict(id));
        }
        job.state = State::Completed;
        job.exit_code = exit_code;
        job.output_ref = output_ref;
        job.attempts += 1;
        job.worker_id = None;
        job.claimed_at = None;
        job.started_at = None;
        job.deadline_at = None;
        job.version += 1;
        job.updated_at = Utc::now();
        job.execution_history.push(record);
        Ok(job.clone())
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        expected_version: i64,
        next_run_at: DateTime<Utc>,
        record: ExecutionRecord,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        if job.version != expected_version {
            return Err(Error::VersionConflict(id));
        }
        job.state = State::Pending;
        job.run_at = Some(next_run_at);
        job.attempts += 1;
        job.error_message = record.error.clone();
        job.worker_id = None;
        job.claimed_at = None;
        job.started_at = None;
        job.deadline_at = None;
        job.version += 1;
        job.updated_at = Utc::now();
        job.execution_history.push(record);
        Ok(job.clone())
    }

    async fn move_to_dlq(
        &self,
        id: JobId,
        expected_version: i64,
        reason: String,
        record: ExecutionRecord,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        if job.version != expected_version {
            return Err(Error::VersionConflict(id));
        }
        job.state = State::Dead;
        job.error_message = Some(reason);
        job.attempts += 1;
        job.worker_id = None;
        job.claimed_at = None;
        job.started_at = None;
        job.deadline_at = None;
        job.version += 1;
        job.updated_at = Utc::now();
        job.execution_history.push(record);
        Ok(job.clone())
    }

    async fn dlq_retry(
        &self,
        id: JobId,
        reset_attempts: bool,
        new_max_retries: Option<u32>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        if job.state != State::Dead {
            return Err(Error::NotFound(id));
        }
        job.state = State::Pending;
        if reset_attempts {
            job.attempts = 0;
        }
        if let Some(max) = new_max_retries {
            job.max_retries = max;
        }
        job.error_message = None;
        job.version += 1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn dlq_purge_all(&self) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, j| j.state != State::Dead);
        Ok((before - jobs.len()) as u64)
    }

    async fn dlq_purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state == State::Dead && j.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn promote_scheduled(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.state == State::Scheduled && job.run_at.map(|t| t <= now).unwrap_or(false) {
                job.state = State::Pending;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.state == State::Processing && j.deadline_at.map(|d| d < now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn reset_all_processing(&self) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.state == State::Processing {
                job.state = State::Pending;
                job.worker_id = None;
                job.claimed_at = None;
                job.started_at = None;
                job.deadline_at = None;
                job.version += 1;
                job.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn reset_worker(&self, worker_id: &str) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.state == State::Processing && job.worker_id.as_deref() == Some(worker_id) {
                job.state = State::Pending;
                job.worker_id = None;
                job.claimed_at = None;
                job.started_at = None;
                job.deadline_at = None;
                job.version += 1;
                job.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel(&self, id: JobId) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(Error::NotFound(id))?;
        job.state = State::Cancelled;
        job.worker_id = None;
        job.claimed_at = None;
        job.started_at = None;
        job.deadline_at = None;
        job.version += 1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}
