//! End-to-end scenarios against `QueueService` + `InMemoryJobStore` + a
//! scripted `CommandExecutor`, no live database required.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use queue_core::executor::{CommandExecutor, ExecutionOutcome};
use queue_core::job::{JobSpec, Priority};
use queue_core::metrics::InMemoryMetrics;
use queue_core::pool::WorkerPool;
use queue_core::queue::QueueService;
use queue_core::retry::RetryPolicy;
use queue_core::security::CommandFilter;
use queue_core::store::JobStore;
use queue_testing::InMemoryJobStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;

/// Executor whose per-command behavior is scripted ahead of time: each
/// command maps to a queue of outcomes, consumed one at a time so a command
/// can fail N times then succeed, exactly as the scenarios require. Also
/// records the order commands were actually executed in, so tests can
/// assert on claim order (e.g. priority overtake) rather than only on
/// eventual state.
struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Vec<ExecutionOutcome>>>,
    calls: AtomicUsize,
    call_order: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new(scripts: HashMap<String, Vec<ExecutionOutcome>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            calls: AtomicUsize::new(0),
            call_order: Mutex::new(Vec::new()),
        }
    }

    async fn call_order(&self) -> Vec<String> {
        self.call_order.lock().await.clone()
    }

    fn ok() -> ExecutionOutcome {
        ExecutionOutcome {
            success: true,
            exit_code: Some(0),
            output_ref: Some("ok".to_string()),
            error: None,
        }
    }

    fn err() -> ExecutionOutcome {
        ExecutionOutcome {
            success: false,
            exit_code: Some(1),
            output_ref: None,
            error: Some("boom".to_string()),
        }
    }

    fn timeout() -> ExecutionOutcome {
        ExecutionOutcome {
            success: false,
            exit_code: None,
            output_ref: None,
            error: Some("timed out".to_string()),
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, command: &str, _timeout: Duration) -> ExecutionOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.call_order.lock().await.push(command.to_string());
        let mut scripts = self.scripts.lock().await;
        match scripts.get_mut(command) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Self::ok(),
        }
    }
}

fn harness(
    scripts: HashMap<String, Vec<ExecutionOutcome>>,
) -> (Arc<QueueService>, Arc<WorkerPool>, Arc<ScriptedExecutor>) {
    let store = Arc::new(InMemoryJobStore::new());
    let retry_policy = RetryPolicy::new(Duration::milliseconds(50), Duration::seconds(5), 0.0);
    let metrics = Arc::new(InMemoryMetrics::default());
    let queue = Arc::new(QueueService::new(store, retry_policy, metrics.clone()));
    let executor = Arc::new(ScriptedExecutor::new(scripts));
    let filter = Arc::new(CommandFilter::default());
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        executor.clone(),
        filter,
        metrics,
        StdDuration::from_millis(20),
    ));
    (queue, pool, executor)
}

async fn wait_for_state(queue: &Arc<QueueService>, id: queue_core::job::JobId, state: queue_core::job::State, timeout: StdDuration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(job) = queue.get(id).await {
            if job.state == state {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}

async fn wait_for_history(queue: &Arc<QueueService>, id: queue_core::job::JobId, timeout: StdDuration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(job) = queue.get(id).await {
            if !job.execution_history.is_empty() {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn s1_quick_success() {
    let (queue, pool, _executor) = harness(HashMap::new());
    let job = queue
        .enqueue(JobSpec::new("echo OK").priority(Priority::Medium).max_retries(3))
        .await
        .unwrap();
    pool.start(1);

    let completed = wait_for_state(&queue, job.id, queue_core::job::State::Completed, StdDuration::from_secs(5)).await;
    assert!(completed, "job should complete within 5s");

    let final_job = queue.get(job.id).await.unwrap();
    assert_eq!(final_job.attempts, 1);
    pool.stop_immediate().await;
}

#[tokio::test]
async fn s2_retry_then_succeed() {
    let mut scripts = HashMap::new();
    scripts.insert(
        "flaky".to_string(),
        vec![ScriptedExecutor::err(), ScriptedExecutor::ok()],
    );
    let (queue, pool, _executor) = harness(scripts);

    let job = queue
        .enqueue(JobSpec::new("flaky").max_retries(2).timeout(Duration::seconds(5)))
        .await
        .unwrap();
    pool.start(1);

    let completed = wait_for_state(&queue, job.id, queue_core::job::State::Completed, StdDuration::from_secs(5)).await;
    assert!(completed);

    let final_job = queue.get(job.id).await.unwrap();
    assert_eq!(final_job.attempts, 2);
    assert_eq!(final_job.execution_history.len(), 2);
    assert!(final_job.execution_history[0].error.is_some());
    assert!(final_job.execution_history[1].error.is_none());
    pool.stop_immediate().await;
}

#[tokio::test]
async fn s3_permanent_failure_to_dead_letter() {
    let mut scripts = HashMap::new();
    scripts.insert(
        "always_fails".to_string(),
        vec![ScriptedExecutor::err(); 5],
    );
    let (queue, pool, _executor) = harness(scripts);

    let job = queue
        .enqueue(JobSpec::new("always_fails").max_retries(1))
        .await
        .unwrap();
    pool.start(1);

    let dead = wait_for_state(&queue, job.id, queue_core::job::State::Dead, StdDuration::from_secs(5)).await;
    assert!(dead, "job should end up dead-lettered");

    let final_job = queue.get(job.id).await.unwrap();
    assert_eq!(final_job.attempts, 2);
    assert!(final_job.error_message.unwrap().contains("max retries"));
    pool.stop_immediate().await;
}

#[tokio::test]
async fn s6_timeout_routes_through_failure_path() {
    let mut scripts = HashMap::new();
    scripts.insert("slow".to_string(), vec![ScriptedExecutor::timeout()]);
    let (queue, pool, _executor) = harness(scripts);

    let job = queue
        .enqueue(JobSpec::new("slow").max_retries(1).timeout(Duration::seconds(2)))
        .await
        .unwrap();
    pool.start(1);

    let retried_or_dead = wait_for_history(&queue, job.id, StdDuration::from_secs(5)).await;
    assert!(retried_or_dead);

    let final_job = queue.get(job.id).await.unwrap();
    assert!(final_job.execution_history[0]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
    pool.stop_immediate().await;
}

#[tokio::test]
async fn s4_priority_overtake() {
    let (queue, pool, executor) = harness(HashMap::new());

    queue
        .enqueue(JobSpec::new("low_job").priority(Priority::Low))
        .await
        .unwrap();
    let high = queue
        .enqueue(JobSpec::new("high_job").priority(Priority::Critical))
        .await
        .unwrap();

    pool.start(1);

    let completed = wait_for_state(&queue, high.id, queue_core::job::State::Completed, StdDuration::from_secs(5)).await;
    assert!(completed, "the critical-priority job should complete");

    let order = executor.call_order().await;
    assert_eq!(
        order.first().map(String::as_str),
        Some("high_job"),
        "a higher-priority job enqueued after a lower-priority one must still be claimed first"
    );
    pool.stop_immediate().await;
}

#[tokio::test]
async fn s5_scheduled_future() {
    let (queue, pool, _executor) = harness(HashMap::new());

    let job = queue
        .enqueue(JobSpec::new("later").run_at(Utc::now() + Duration::milliseconds(150)))
        .await
        .unwrap();
    assert_eq!(job.state, queue_core::job::State::Scheduled);

    pool.start(1);

    tokio::time::sleep(StdDuration::from_millis(30)).await;
    let still_scheduled = queue.get(job.id).await.unwrap();
    assert_eq!(
        still_scheduled.state,
        queue_core::job::State::Scheduled,
        "job must not be claimable before its run_at"
    );

    tokio::time::sleep(StdDuration::from_millis(150)).await;
    let promoted = queue.promote_scheduled().await.unwrap();
    assert!(promoted >= 1, "sweep should promote the now-eligible job");

    let completed = wait_for_state(&queue, job.id, queue_core::job::State::Completed, StdDuration::from_secs(5)).await;
    assert!(completed, "job should run once promoted out of the scheduled state");
    pool.stop_immediate().await;
}

#[tokio::test]
async fn dlq_retry_round_trip() {
    let mut scripts = HashMap::new();
    scripts.insert("doomed".to_string(), vec![ScriptedExecutor::err()]);
    let (queue, pool, _executor) = harness(scripts);

    let job = queue
        .enqueue(JobSpec::new("doomed").max_retries(0))
        .await
        .unwrap();
    pool.start(1);

    let dead = wait_for_state(&queue, job.id, queue_core::job::State::Dead, StdDuration::from_secs(5)).await;
    assert!(dead, "job with no retries left should land in the dead-letter state");
    pool.stop_immediate().await;

    let retried = queue.dlq_retry(job.id, true, Some(3)).await.unwrap();
    assert_eq!(retried.state, queue_core::job::State::Pending);
    assert_eq!(retried.attempts, 0);
    assert_eq!(retried.max_retries, 3);
    assert!(retried.error_message.is_none());

    let fetched = queue.get(job.id).await.unwrap();
    assert_eq!(fetched.state, queue_core::job::State::Pending);
    assert_eq!(fetched.max_retries, 3);
}

#[tokio::test]
async fn s7_crash_recovery_returns_processing_jobs_to_pending() {
    let store = Arc::new(InMemoryJobStore::new());
    let claimed = store
        .insert(queue_core::job::Job::from_spec(JobSpec::new("x"), Utc::now()))
        .await
        .unwrap();
    store.claim_next("dead-worker").await.unwrap();

    let retry_policy = RetryPolicy::default();
    let metrics = Arc::new(InMemoryMetrics::default());
    let queue = QueueService::new(store.clone(), retry_policy, metrics);

    let recovered = queue.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let job = queue.get(claimed.id).await.unwrap();
    assert_eq!(job.state, queue_core::job::State::Pending);
    assert!(job.worker_id.is_none());
    assert!(job.claimed_at.is_none());

    // idempotent: running it again changes nothing further.
    let recovered_again = queue.recover().await.unwrap();
    assert_eq!(recovered_again, 0);
}
