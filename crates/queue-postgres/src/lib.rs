//! PostgreSQL implementation of the `queue-core` job store.
//!
//! # Features
//!
//! - Atomic claim via `FOR UPDATE SKIP LOCKED` plus `UPDATE ... RETURNING`
//! - Optimistic concurrency on every mutating operation via a `version` column
//! - Exponential backoff retry, dead-letter transition, and crash recovery
//!   all delegated to `queue_core::queue::QueueService`; this crate only
//!   implements the atomic primitives `JobStore` requires
//!
//! # Database Schema
//!
//! See `migrations/0001_init.sql`:
//!
//! ```sql
//! CREATE TYPE job_priority AS ENUM ('low', 'medium', 'high', 'critical');
//! CREATE TYPE job_state AS ENUM ('pending', 'scheduled', 'processing', 'completed', 'dead', 'cancelled');
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     priority job_priority NOT NULL DEFAULT 'medium',
//!     state job_state NOT NULL DEFAULT 'pending',
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!     timeout_ms BIGINT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     run_at TIMESTAMPTZ,
//!     claimed_at TIMESTAMPTZ,
//!     started_at TIMESTAMPTZ,
//!     deadline_at TIMESTAMPTZ,
//!     worker_id TEXT,
//!     exit_code INTEGER,
//!     error_message TEXT,
//!     version BIGINT NOT NULL DEFAULT 1,
//!     output_ref TEXT,
//!     execution_history JSONB NOT NULL DEFAULT '[]'::jsonb
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use queue_postgres::PgJobStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/queue").await?;
//! let store = PgJobStore::new(pool);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use queue_core::error::{Error, Result};
use queue_core::job::{ExecutionRecord, Job, JobId, Priority, State};
use queue_core::store::{JobStore, ListQuery};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(sqlx::Type)]
#[sqlx(type_name = "job_priority", rename_all = "lowercase")]
enum PgPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl From<Priority> for PgPriority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Low => PgPriority::Low,
            Priority::Medium => PgPriority::Medium,
            Priority::High => PgPriority::High,
            Priority::Critical => PgPriority::Critical,
        }
    }
}

impl From<PgPriority> for Priority {
    fn from(p: PgPriority) -> Self {
        match p {
            PgPriority::Low => Priority::Low,
            PgPriority::Medium => Priority::Medium,
            PgPriority::High => Priority::High,
            PgPriority::Critical => Priority::Critical,
        }
    }
}

#[derive(sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "lowercase")]
enum PgState {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Dead,
    Cancelled,
}

impl From<State> for PgState {
    fn from(s: State) -> Self {
        match s {
            State::Pending => PgState::Pending,
            State::Scheduled => PgState::Scheduled,
            State::Processing => PgState::Processing,
            State::Completed => PgState::Completed,
            State::Dead => PgState::Dead,
            State::Cancelled => PgState::Cancelled,
        }
    }
}

impl From<PgState> for State {
    fn from(s: PgState) -> Self {
        match s {
            PgState::Pending => State::Pending,
            PgState::Scheduled => State::Scheduled,
            PgState::Processing => State::Processing,
            PgState::Completed => State::Completed,
            PgState::Dead => State::Dead,
            PgState::Cancelled => State::Cancelled,
        }
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job> {
    let priority: PgPriority = row.try_get("priority").map_err(map_sqlx)?;
    let state: PgState = row.try_get("state").map_err(map_sqlx)?;
    let timeout_ms: i64 = row.try_get("timeout_ms").map_err(map_sqlx)?;
    let history: sqlx::types::Json<Vec<ExecutionRecord>> =
        row.try_get("execution_history").map_err(map_sqlx)?;

    Ok(Job {
        id: JobId(row.try_get("id").map_err(map_sqlx)?),
        command: row.try_get("command").map_err(map_sqlx)?,
        priority: priority.into(),
        state: state.into(),
        attempts: row.try_get::<i32, _>("attempts").map_err(map_sqlx)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(map_sqlx)? as u32,
        timeout: Duration::milliseconds(timeout_ms),
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
        run_at: row.try_get("run_at").map_err(map_sqlx)?,
        claimed_at: row.try_get("claimed_at").map_err(map_sqlx)?,
        started_at: row.try_get("started_at").map_err(map_sqlx)?,
        deadline_at: row.try_get("deadline_at").map_err(map_sqlx)?,
        worker_id: row.try_get("worker_id").map_err(map_sqlx)?,
        exit_code: row.try_get("exit_code").map_err(map_sqlx)?,
        error_message: row.try_get("error_message").map_err(map_sqlx)?,
        version: row.try_get("version").map_err(map_sqlx)?,
        output_ref: row.try_get("output_ref").map_err(map_sqlx)?,
        execution_history: history.0,
    })
}

fn map_sqlx(e: sqlx::Error) -> Error {
    Error::StoreUnavailable(e.to_string())
}

/// PostgreSQL-backed `JobStore`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let priority: PgPriority = job.priority.into();
        let state: PgState = job.state.into();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, priority, state, attempts, max_retries, timeout_ms,
                created_at, updated_at, run_at, version, execution_history
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, '[]'::jsonb)
            RETURNING *
            "#,
        )
        .bind(job.id.0)
        .bind(&job.command)
        .bind(priority)
        .bind(state)
        .bind(job.attempts as i32)
        .bind(job.max_retries as i32)
        .bind(job.timeout.num_milliseconds())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.run_at)
        .bind(job.version)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row_to_job(row),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::DuplicateId(job.id))
            }
            Err(e) => Err(map_sqlx(e)),
        }
    }

    async fn get_by_id(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(Error::NotFound(id))?;
        row_to_job(row)
    }

    async fn count_by_state(&self, state: State) -> Result<i64> {
        let pg_state: PgState = state.into();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE state = $1")
            .bind(pg_state)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_get("n").map_err(map_sqlx)
    }

    async fn count_all(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.try_get("n").map_err(map_sqlx)
    }

    async fn list_by_state(&self, state: State, query: ListQuery) -> Result<Vec<Job>> {
        let pg_state: PgState = state.into();
        let limit = if query.limit > 0 { query.limit } else { 100 };
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state = $1 ORDER BY created_at ASC LIMIT $2 OFFSET $3",
        )
        .bind(pg_state)
        .bind(limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// The atomic claim protocol: select the oldest, highest-priority
    /// eligible `pending` row under `FOR UPDATE SKIP LOCKED`, then promote it
    /// to `processing` in the same statement so no other caller can observe
    /// it as available.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobs
                WHERE state = 'pending' AND (run_at IS NULL OR run_at <= NOW())
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'processing',
                worker_id = $1,
                claimed_at = NOW(),
                started_at = NOW(),
                deadline_at = NOW() + (timeout_ms * INTERVAL '1 millisecond'),
                version = version + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(row_to_job).transpose()
    }

    async fn release(&self, id: JobId, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', claimed_at = NULL, started_at = NULL,
                deadline_at = NULL, worker_id = NULL, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND state = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        id: JobId,
        expected_version: i64,
        exit_code: Option<i32>,
        output_ref: Option<String>,
        record: ExecutionRecord,
    ) -> Result<Job> {
        let record_json = serde_json::to_value(&record).map_err(|e| Error::ExecutorFailure(e.to_string()))?;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', exit_code = $3, output_ref = $4,
                attempts = attempts + 1, worker_id = NULL, claimed_at = NULL,
                started_at = NULL, deadline_at = NULL,
                version = version + 1, updated_at = NOW(),
                execution_history = execution_history || $5::jsonb
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(expected_version)
        .bind(exit_code)
        .bind(output_ref)
        .bind(record_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or(Error::VersionConflict(id))?;
        row_to_job(row)
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        expected_version: i64,
        next_run_at: DateTime<Utc>,
        record: ExecutionRecord,
    ) -> Result<Job> {
        let record_json = serde_json::to_value(&record).map_err(|e| Error::ExecutorFailure(e.to_string()))?;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', run_at = $3, attempts = attempts + 1,
                error_message = $4, worker_id = NULL, claimed_at = NULL,
                started_at = NULL, deadline_at = NULL,
                version = version + 1, updated_at = NOW(),
                execution_history = execution_history || $5::jsonb
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(expected_version)
        .bind(next_run_at)
        .bind(&record.error)
        .bind(record_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or(Error::VersionConflict(id))?;
        row_to_job(row)
    }

    async fn move_to_dlq(
        &self,
        id: JobId,
        expected_version: i64,
        reason: String,
        record: ExecutionRecord,
    ) -> Result<Job> {
        let record_json = serde_json::to_value(&record).map_err(|e| Error::ExecutorFailure(e.to_string()))?;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', error_message = $3, attempts = attempts + 1,
                worker_id = NULL, claimed_at = NULL, started_at = NULL, deadline_at = NULL,
                version = version + 1, updated_at = NOW(),
                execution_history = execution_history || $4::jsonb
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(expected_version)
        .bind(reason)
        .bind(record_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or(Error::VersionConflict(id))?;
        row_to_job(row)
    }

    async fn dlq_retry(
        &self,
        id: JobId,
        reset_attempts: bool,
        new_max_retries: Option<u32>,
    ) -> Result<Job> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = CASE WHEN $2 THEN 0 ELSE attempts END,
                max_retries = COALESCE($3, max_retries),
                error_message = NULL,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND state = 'dead'
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(reset_attempts)
        .bind(new_max_retries.map(|n| n as i32))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or(Error::NotFound(id))?;
        row_to_job(row)
    }

    async fn dlq_purge_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'dead'")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn dlq_purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'dead' AND updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn promote_scheduled(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', updated_at = NOW() WHERE state = 'scheduled' AND run_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn list_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE state = 'processing' AND deadline_at < $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn reset_all_processing(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', claimed_at = NULL, started_at = NULL,
                deadline_at = NULL, worker_id = NULL, version = version + 1, updated_at = NOW()
            WHERE state = 'processing'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn reset_worker(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', claimed_at = NULL, started_at = NULL,
                deadline_at = NULL, worker_id = NULL, version = version + 1, updated_at = NOW()
            WHERE worker_id = $1 AND state = 'processing'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn cancel(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled', worker_id = NULL, claimed_at = NULL,
                started_at = NULL, deadline_at = NULL, version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .ok_or(Error::NotFound(id))?;
        row_to_job(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> Option<PgPool> {
        let url = std::env::var("QUEUE_TEST_DATABASE_URL").ok()?;
        PgPool::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn claim_next_returns_none_on_empty_queue() {
        let Some(pool) = pool().await else {
            eprintln!("skipping: QUEUE_TEST_DATABASE_URL not set or unreachable");
            return;
        };
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgJobStore::new(pool);
        let claimed = store.claim_next("worker-a").await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn insert_then_claim_round_trips() {
        let Some(pool) = pool().await else {
            eprintln!("skipping: QUEUE_TEST_DATABASE_URL not set or unreachable");
            return;
        };
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgJobStore::new(pool);

        let now = Utc::now();
        let job = Job {
            id: JobId(Uuid::new_v4()),
            command: "echo hi".to_string(),
            priority: Priority::High,
            state: State::Pending,
            attempts: 0,
            max_retries: 3,
            timeout: Duration::seconds(30),
            created_at: now,
            updated_at: now,
            run_at: None,
            claimed_at: None,
            started_at: None,
            deadline_at: None,
            worker_id: None,
            exit_code: None,
            error_message: None,
            version: 1,
            output_ref: None,
            execution_history: Vec::new(),
        };
        let inserted = store.insert(job.clone()).await.unwrap();
        assert_eq!(inserted.id, job.id);

        let claimed = store.claim_next("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));

        let second = store.claim_next("worker-b").await.unwrap();
        assert!(second.is_none());
    }

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: JobId(Uuid::new_v4()),
            command: "echo hi".to_string(),
            priority: Priority::Medium,
            state: State::Pending,
            attempts: 0,
            max_retries: 3,
            timeout: Duration::seconds(30),
            created_at: now,
            updated_at: now,
            run_at: None,
            claimed_at: None,
            started_at: None,
            deadline_at: None,
            worker_id: None,
            exit_code: None,
            error_message: None,
            version: 1,
            output_ref: None,
            execution_history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn claim_then_release_returns_job_to_pending() {
        let Some(pool) = pool().await else {
            eprintln!("skipping: QUEUE_TEST_DATABASE_URL not set or unreachable");
            return;
        };
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgJobStore::new(pool);

        let job = store.insert(sample_job()).await.unwrap();
        store.claim_next("worker-a").await.unwrap();

        let released = store.release(job.id, "worker-a").await.unwrap();
        assert!(released);

        let fetched = store.get_by_id(job.id).await.unwrap();
        assert_eq!(fetched.state, State::Pending);
        assert!(fetched.worker_id.is_none());
    }

    #[tokio::test]
    async fn cancel_moves_job_to_cancelled() {
        let Some(pool) = pool().await else {
            eprintln!("skipping: QUEUE_TEST_DATABASE_URL not set or unreachable");
            return;
        };
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgJobStore::new(pool);

        let job = store.insert(sample_job()).await.unwrap();
        let cancelled = store.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.state, State::Cancelled);
    }

    #[tokio::test]
    async fn dlq_retry_round_trips_a_dead_job_back_to_pending() {
        let Some(pool) = pool().await else {
            eprintln!("skipping: QUEUE_TEST_DATABASE_URL not set or unreachable");
            return;
        };
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgJobStore::new(pool);

        let mut job = sample_job();
        job.state = State::Dead;
        job.attempts = 3;
        job.error_message = Some("max retries exceeded".to_string());
        let job = store.insert(job).await.unwrap();

        let retried = store.dlq_retry(job.id, true, Some(5)).await.unwrap();
        assert_eq!(retried.state, State::Pending);
        assert_eq!(retried.attempts, 0);
        assert_eq!(retried.max_retries, 5);
        assert!(retried.error_message.is_none());

        let purged = store.dlq_purge_all().await.unwrap();
        assert_eq!(purged, 0, "the retried job is pending, not dead, so purge should leave it alone");
    }
}
