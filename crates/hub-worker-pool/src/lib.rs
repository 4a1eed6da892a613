//! Bounded priority worker pool
//!
//! Every listener callback, scheduled firing and automation action in the
//! hub runs as a [`Job`] on this pool, never on the caller's stack. The pool
//! keeps a fixed set of worker tasks pulling from one priority queue; lower
//! [`JobPriority`] values run first and jobs of equal priority run in
//! submission order.
//!
//! Job bodies are synchronous and may block (device scanners do network
//! I/O), so each one is executed on tokio's blocking thread pool while the
//! worker task that picked it awaits the result. A job returning an error or
//! panicking is logged and otherwise ignored.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hub_core::events::{CALL_SERVICE, STATE_CHANGED, TIME_CHANGED};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Default number of workers
pub const DEFAULT_WORKER_COUNT: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Scheduling class of a job; lower values are dequeued first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum JobPriority {
    /// Service calls, so commands are not starved by state churn
    Service = 0,
    /// State change deliveries
    State = 2,
    /// Timer firings and tick events
    Time = 3,
    #[default]
    Default = 4,
}

impl JobPriority {
    /// Priority used to deliver an event of the given type
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            CALL_SERVICE => Self::Service,
            STATE_CHANGED => Self::State,
            TIME_CHANGED => Self::Time,
            _ => Self::Default,
        }
    }
}

type JobFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// One unit of work: a priority, a label for diagnostics and a runner
pub struct Job {
    priority: JobPriority,
    label: String,
    run: JobFn,
}

impl Job {
    pub fn new<F>(priority: JobPriority, label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            priority,
            label: label.into(),
            run: Box::new(run),
        }
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// A job currently executing on a worker
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub label: String,
    pub started: DateTime<Utc>,
}

/// Called with the running jobs and the queue depth when the backlog grows
pub type BusyCallback = Arc<dyn Fn(&[RunningJob], usize) + Send + Sync>;

/// Pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    DEFAULT_WORKER_COUNT
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

struct QueuedJob {
    job: Job,
    sequence: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest item: invert so the lowest priority
        // value and then the lowest sequence number come out first
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Queue {
    heap: BinaryHeap<QueuedJob>,
    next_sequence: u64,
    /// Depth above which the busy callback fires; doubles after each firing
    busy_warning_limit: usize,
}

struct PoolInner {
    queue: Mutex<Queue>,
    wakeup: Notify,
    /// Jobs queued plus jobs running
    pending: watch::Sender<usize>,
    running: DashMap<u64, RunningJob>,
    next_run_id: AtomicU64,
    accepting: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    busy_callback: BusyCallback,
    worker_count: usize,
}

impl PoolInner {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        // Jobs never run under this lock, so poisoning cannot leave the heap
        // half-modified
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self) -> Option<Job> {
        self.lock_queue().heap.pop().map(|queued| queued.job)
    }

    async fn run(&self, job: Job) {
        let run_id = self.next_run_id.fetch_add(1, AtomicOrdering::Relaxed);
        let Job {
            label, run, priority, ..
        } = job;

        self.running.insert(
            run_id,
            RunningJob {
                label: label.clone(),
                started: Utc::now(),
            },
        );

        trace!(job = %label, ?priority, "Running job");

        match tokio::task::spawn_blocking(run).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job = %label, error = %e, "Job failed"),
            Err(e) if e.is_panic() => error!(job = %label, "Job panicked"),
            Err(e) => error!(job = %label, error = %e, "Job was cancelled"),
        }

        self.running.remove(&run_id);
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Fixed-size pool of workers fed by a priority queue
///
/// Must be created inside a tokio runtime; workers are spawned immediately.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool whose backlog warnings go to the log
    pub fn new(worker_count: usize) -> Arc<Self> {
        Self::with_busy_callback(worker_count, Arc::new(log_busy))
    }

    pub fn from_config(config: &PoolConfig) -> Arc<Self> {
        Self::new(config.workers)
    }

    /// Start a pool with a custom backlog callback
    ///
    /// The callback fires when the queue depth first exceeds
    /// `worker_count²`, and again each time it exceeds double the previous
    /// threshold.
    pub fn with_busy_callback(worker_count: usize, busy_callback: BusyCallback) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let (pending, _) = watch::channel(0);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(PoolInner {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                busy_warning_limit: worker_count * worker_count,
            }),
            wakeup: Notify::new(),
            pending,
            running: DashMap::new(),
            next_run_id: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            shutdown_tx,
            busy_callback,
            worker_count,
        });

        let workers = (0..worker_count)
            .map(|index| {
                let inner = inner.clone();
                let shutdown_rx = inner.shutdown_tx.subscribe();
                tokio::spawn(worker_loop(inner, index, shutdown_rx))
            })
            .collect();

        debug!(worker_count, "Started worker pool");

        Arc::new(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a job
    ///
    /// Returns as soon as the job is queued. Fails once shutdown has begun.
    pub fn submit(&self, job: Job) -> Result<(), PoolError> {
        let busy_depth = {
            // `accepting` only flips under the queue lock, so a job accepted
            // here is counted before shutdown starts draining
            let mut queue = self.inner.lock_queue();
            if !self.inner.accepting.load(AtomicOrdering::SeqCst) {
                return Err(PoolError::ShutDown);
            }

            // Count the job before it becomes visible so drain() never
            // observes zero while it sits in the queue
            self.inner.pending.send_modify(|n| *n += 1);

            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.heap.push(QueuedJob { job, sequence });

            let depth = queue.heap.len();
            if depth > queue.busy_warning_limit {
                queue.busy_warning_limit *= 2;
                Some(depth)
            } else {
                None
            }
        };

        self.inner.wakeup.notify_one();

        if let Some(depth) = busy_depth {
            let running: Vec<RunningJob> = self
                .inner
                .running
                .iter()
                .map(|r| r.value().clone())
                .collect();
            (self.inner.busy_callback)(&running, depth);
        }

        Ok(())
    }

    /// Wait until the queue is empty and every dispatched job has returned
    ///
    /// Jobs submitted by running jobs are waited for too. Calling this from
    /// inside a job never completes.
    pub async fn drain(&self) {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    /// Stop accepting jobs, finish the backlog, then stop the workers
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        let was_accepting = {
            let _queue = self.inner.lock_queue();
            self.inner.accepting.swap(false, AtomicOrdering::SeqCst)
        };
        if !was_accepting {
            return;
        }

        info!("Shutting down worker pool");
        self.drain().await;
        let _ = self.inner.shutdown_tx.send(());

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
        debug!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(AtomicOrdering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Jobs waiting to be picked up
    pub fn queue_len(&self) -> usize {
        self.inner.lock_queue().heap.len()
    }

    /// Snapshot of the jobs executing right now
    pub fn running(&self) -> Vec<RunningJob> {
        self.inner
            .running
            .iter()
            .map(|r| r.value().clone())
            .collect()
    }
}

async fn worker_loop(inner: Arc<PoolInner>, index: usize, mut shutdown_rx: broadcast::Receiver<()>) {
    trace!(worker = index, "Worker started");
    loop {
        match inner.pop() {
            Some(job) => inner.run(job).await,
            None => {
                tokio::select! {
                    _ = inner.wakeup.notified() => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }
    }
    trace!(worker = index, "Worker stopped");
}

fn log_busy(running: &[RunningJob], depth: usize) {
    let now = Utc::now();
    let jobs: Vec<String> = running
        .iter()
        .map(|job| format!("{} ({}s)", job.label, (now - job.started).num_seconds()))
        .collect();
    warn!(
        queue_depth = depth,
        running = ?jobs,
        "Worker pool queue is growing"
    );
}

/// Shared handle to a worker pool
pub type SharedWorkerPool = Arc<WorkerPool>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use tokio::sync::oneshot;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Job) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &str| {
            let log = log2.clone();
            let name = name.to_string();
            let priority = match name.as_str() {
                "service" => JobPriority::Service,
                "state" => JobPriority::State,
                "time" => JobPriority::Time,
                _ => JobPriority::Default,
            };
            Job::new(priority, name.clone(), move || {
                log.lock().unwrap().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    /// Occupies the single worker until the returned sender fires
    async fn block_worker(pool: &WorkerPool) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel();
        pool.submit(Job::new(JobPriority::Service, "gate", move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        }))
        .unwrap();
        started_rx.await.unwrap();
        release_tx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_waits_for_all_jobs() {
        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(Job::new(JobPriority::Default, "count", move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }

        pool.drain().await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 50);
        assert_eq!(pool.queue_len(), 0);
        assert!(pool.running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_priority_then_fifo_order() {
        let pool = WorkerPool::new(1);
        let (log, job) = recorder();

        let release = block_worker(&pool).await;
        for name in ["other_a", "time", "state", "other_b", "service"] {
            pool.submit(job(name)).unwrap();
        }
        release.send(()).unwrap();
        pool.drain().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["service", "state", "time", "other_a", "other_b"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_and_panicking_jobs_are_contained() {
        let pool = WorkerPool::new(1);
        let (log, job) = recorder();

        pool.submit(Job::new(JobPriority::Default, "fails", || {
            anyhow::bail!("boom")
        }))
        .unwrap();
        pool.submit(Job::new(JobPriority::Default, "panics", || {
            panic!("listener exploded")
        }))
        .unwrap();
        pool.submit(job("after")).unwrap();

        pool.drain().await;
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_callback_fires_once_per_doubling() {
        let calls: Arc<Mutex<Vec<(Vec<String>, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let pool = WorkerPool::with_busy_callback(
            1,
            Arc::new(move |running: &[RunningJob], depth| {
                let labels = running.iter().map(|r| r.label.clone()).collect();
                calls2.lock().unwrap().push((labels, depth));
            }),
        );
        let (_log, job) = recorder();

        let release = block_worker(&pool).await;
        // Limit starts at 1: depth 2 fires (limit -> 2), depth 3 fires
        // (limit -> 4), depth 4 stays quiet
        for name in ["a", "b", "c", "d"] {
            pool.submit(job(name)).unwrap();
        }

        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].1, 2);
            assert_eq!(calls[1].1, 3);
            assert_eq!(calls[0].0, vec!["gate".to_string()]);
        }

        release.send(()).unwrap();
        pool.drain().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_finishes_backlog_then_rejects() {
        let pool = WorkerPool::new(2);
        let (log, job) = recorder();

        tokio_test::assert_ok!(pool.submit(job("before")));
        pool.shutdown().await;

        assert_eq!(*log.lock().unwrap(), vec!["before"]);
        assert!(!pool.is_running());
        assert_eq!(pool.submit(job("late")), Err(PoolError::ShutDown));

        // Second call is a no-op
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_racing_shutdown_never_strands_jobs() {
        for _ in 0..50 {
            let pool = WorkerPool::new(2);
            let accepted = Arc::new(AtomicUsize::new(0));
            let ran = Arc::new(AtomicUsize::new(0));

            let submitters: Vec<_> = (0..4)
                .map(|_| {
                    let pool = pool.clone();
                    let accepted = accepted.clone();
                    let ran = ran.clone();
                    std::thread::spawn(move || {
                        for _ in 0..200 {
                            let ran = ran.clone();
                            let job = Job::new(JobPriority::Default, "racer", move || {
                                ran.fetch_add(1, AtomicOrdering::SeqCst);
                                Ok(())
                            });
                            if pool.submit(job).is_err() {
                                break;
                            }
                            accepted.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                    })
                })
                .collect();

            pool.shutdown().await;
            for submitter in submitters {
                submitter.join().unwrap();
            }

            // Every accepted job ran and nothing is left counted as pending
            tokio::time::timeout(std::time::Duration::from_secs(5), pool.drain())
                .await
                .expect("drain hung after shutdown");
            assert_eq!(ran.load(AtomicOrdering::SeqCst), accepted.load(AtomicOrdering::SeqCst));
            assert_eq!(pool.queue_len(), 0);
        }
    }

    #[test]
    fn test_priority_from_event_type() {
        assert_eq!(
            JobPriority::from_event_type(STATE_CHANGED),
            JobPriority::State
        );
        assert_eq!(JobPriority::from_event_type(TIME_CHANGED), JobPriority::Time);
        assert_eq!(
            JobPriority::from_event_type("custom"),
            JobPriority::Default
        );
        assert!(JobPriority::Service < JobPriority::Default);
    }
}
