//! `WorkerPool`: manages a set of [`Worker`]s — start, scale, and
//! graceful/immediate shutdown.

use crate::executor::CommandExecutor;
use crate::metrics::Metrics;
use crate::queue::QueueService;
use crate::security::CommandFilter;
use crate::worker::{Worker, WorkerStats};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Handle {
    worker: Arc<Worker>,
    join: JoinHandle<()>,
    /// Insertion order, stamped from `next_id` at spawn time. `DashMap`
    /// iteration order is unspecified, so `scale_down` sorts on this instead
    /// of relying on `iter()` order directly.
    seq: usize,
}

pub struct WorkerPool {
    queue: Arc<QueueService>,
    executor: Arc<dyn CommandExecutor>,
    filter: Arc<CommandFilter>,
    metrics: Arc<dyn Metrics>,
    poll_interval: std::time::Duration,
    workers: DashMap<String, Handle>,
    next_id: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub worker_count: usize,
    pub workers: Vec<(String, WorkerStats)>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<QueueService>,
        executor: Arc<dyn CommandExecutor>,
        filter: Arc<CommandFilter>,
        metrics: Arc<dyn Metrics>,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            queue,
            executor,
            filter,
            metrics,
            poll_interval,
            workers: DashMap::new(),
            next_id: AtomicUsize::new(0),
        }
    }

    fn spawn_one(&self) -> Arc<Worker> {
        let idx = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("worker-{idx}");
        let worker = Arc::new(Worker::new(
            id.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.filter.clone(),
            self.metrics.clone(),
            self.poll_interval,
        ));
        let join = worker.clone().spawn();
        self.workers.insert(id, Handle { worker: worker.clone(), join, seq: idx });
        worker
    }

    /// Spawn `n` workers.
    pub fn start(&self, n: usize) {
        info!(count = n, "starting worker pool");
        for _ in 0..n {
            self.spawn_one();
        }
    }

    pub fn scale_up(&self, k: usize) {
        info!(count = k, "scaling up");
        for _ in 0..k {
            self.spawn_one();
        }
    }

    /// Stop `k` workers, preferring idle ones (no current job) over busy
    /// ones. Busy workers are stopped in insertion order once idle ones run
    /// out, so `scale_down` is reproducible across calls.
    pub async fn scale_down(&self, k: usize) {
        let mut candidates: Vec<(String, usize)> = Vec::new();
        for entry in self.workers.iter() {
            candidates.push((entry.key().clone(), entry.value().seq));
        }

        let mut idle = Vec::new();
        let mut busy = Vec::new();
        for (id, seq) in candidates {
            if let Some(entry) = self.workers.get(&id) {
                if entry.worker.current_job().await.is_some() {
                    busy.push((id, seq));
                } else {
                    idle.push((id, seq));
                }
            }
        }
        idle.sort_by_key(|(_, seq)| *seq);
        busy.sort_by_key(|(_, seq)| *seq);
        idle.extend(busy);

        for (id, _) in idle.into_iter().take(k) {
            if let Some((_, handle)) = self.workers.remove(&id) {
                handle.worker.stop().await;
                let _ = handle.join.await;
            }
        }
    }

    /// Signal every worker to stop, then wait up to `timeout` for them to
    /// drain their current job. Workers still running after the deadline are
    /// abandoned; the caller should follow up with `QueueService::recover`
    /// semantics (or `reset_worker` per id) to reclaim their orphaned claims.
    pub async fn stop_graceful(&self, timeout: std::time::Duration) {
        info!("stopping worker pool gracefully");
        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some(entry) = self.workers.get(id) {
                entry.worker.stop().await;
            }
        }

        let drain = async {
            for id in &ids {
                if let Some((_, handle)) = self.workers.remove(id) {
                    let _ = handle.join.await;
                }
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("graceful shutdown timed out, escalating to immediate stop");
            self.stop_immediate_internal().await;
        }
    }

    /// Stop without waiting for in-flight jobs to finish; their claims are
    /// left for the timeout reaper or an explicit `reset_worker` call.
    pub async fn stop_immediate(&self) {
        warn!("stopping worker pool immediately");
        self.stop_immediate_internal().await;
    }

    async fn stop_immediate_internal(&self) {
        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.workers.remove(&id) {
                handle.join.abort();
                let _ = self.queue.reset_worker(&handle.worker.id).await;
            }
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let mut workers = Vec::new();
        for entry in self.workers.iter() {
            workers.push((entry.key().clone(), entry.worker.stats().await));
        }
        PoolStatus {
            worker_count: self.workers.len(),
            workers,
        }
    }
}
