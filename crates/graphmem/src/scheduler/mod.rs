//! Priority-queue task scheduler with a bounded worker pool
//!
//! Explicit queue + workers instead of implicit timers, so ordering,
//! deferral and backoff are testable in isolation. Extraction (HIGH) is
//! additionally serialized through a single-slot semaphore; MEDIUM/LOW
//! tasks share the remaining worker slots. A failing task is retried with
//! exponential backoff up to a cap and then parked as permanently failed —
//! it never takes the process down.

pub mod activity;

pub use activity::ActivityTracker;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

/// Background work descriptors. Two pending tasks with the same kind and
/// arguments collapse into one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Drain up to `limit` pending events into the graph
    ExtractPending { limit: usize },
    /// Refresh stale summary nodes
    RefreshSummaries,
    /// Decay relevance of long-untouched events
    DecayRelevance,
}

impl TaskKind {
    pub fn priority(&self) -> Priority {
        match self {
            Self::ExtractPending { .. } => Priority::High,
            Self::RefreshSummaries => Priority::Medium,
            Self::DecayRelevance => Priority::Low,
        }
    }

    /// All current tasks defer to interactive use
    pub fn requires_quiet(&self) -> bool {
        true
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExtractPending { .. } => "extract_pending",
            Self::RefreshSummaries => "refresh_summaries",
            Self::DecayRelevance => "decay_relevance",
        }
    }

    fn dedup_key(&self) -> String {
        format!("{:?}", self)
    }
}

/// Per-task lifecycle: Scheduled → Running → {Completed | Retrying →
/// Scheduled | FailedPermanently}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Scheduled,
    Running,
    Retrying,
    Completed,
    FailedPermanently,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, kind: &TaskKind) -> EngineResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    pub queue_depth: usize,
    pub running: usize,
    pub completed: usize,
    pub retries: usize,
    pub failed_permanently: usize,
    pub last_completed: HashMap<String, DateTime<Utc>>,
}

struct QueuedTask {
    kind: TaskKind,
    priority: Priority,
    run_at: Instant,
    attempt: u32,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then earlier run time, then FIFO
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.run_at.cmp(&self.run_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    config: Arc<Config>,
    activity: Arc<ActivityTracker>,
    executor: Arc<dyn TaskExecutor>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
    pending_keys: DashMap<String, ()>,
    high_slot: Semaphore,
    running: AtomicBool,
    seq: AtomicU64,
    tasks_running: AtomicUsize,
    tasks_completed: AtomicUsize,
    tasks_retried: AtomicUsize,
    tasks_failed: AtomicUsize,
    last_completed: DashMap<String, DateTime<Utc>>,
}

pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        config: Arc<Config>,
        activity: Arc<ActivityTracker>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                activity,
                executor,
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                pending_keys: DashMap::new(),
                high_slot: Semaphore::new(1),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                tasks_running: AtomicUsize::new(0),
                tasks_completed: AtomicUsize::new(0),
                tasks_retried: AtomicUsize::new(0),
                tasks_failed: AtomicUsize::new(0),
                last_completed: DashMap::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..self.inner.config.worker_count.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                debug!("Scheduler worker {} started", worker_id);
                worker_loop(inner).await;
                debug!("Scheduler worker {} stopped", worker_id);
            }));
        }
        info!("Task scheduler started with {} workers", workers.len());
    }

    /// Enqueue a task. Returns false when an identical task is already
    /// pending.
    pub fn schedule(&self, kind: TaskKind) -> bool {
        self.schedule_after(kind, Duration::ZERO)
    }

    fn schedule_after(&self, kind: TaskKind, delay: Duration) -> bool {
        let key = kind.dedup_key();
        if self.inner.pending_keys.contains_key(&key) {
            debug!("Deduplicated task {}", key);
            return false;
        }
        self.inner.pending_keys.insert(key, ());
        self.inner.push(kind, delay, 0);
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        let queue_depth = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        SchedulerStatus {
            queue_depth,
            running: self.inner.tasks_running.load(Ordering::Relaxed),
            completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            retries: self.inner.tasks_retried.load(Ordering::Relaxed),
            failed_permanently: self.inner.tasks_failed.load(Ordering::Relaxed),
            last_completed: self
                .inner
                .last_completed
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        futures::future::join_all(workers).await;
        info!("Task scheduler shut down");
    }
}

impl SchedulerInner {
    fn push(&self, kind: TaskKind, delay: Duration, attempt: u32) {
        let priority = kind.priority();
        let task = QueuedTask {
            kind,
            priority,
            run_at: Instant::now() + delay,
            attempt,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        self.notify.notify_one();
    }
}

enum Next {
    Run(QueuedTask),
    Wait(Duration),
    Idle,
}

async fn worker_loop(inner: Arc<SchedulerInner>) {
    while inner.running.load(Ordering::SeqCst) {
        let next = {
            let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            let until_due = queue
                .peek()
                .map(|task| task.run_at.saturating_duration_since(Instant::now()));
            match until_due {
                Some(wait) if wait.is_zero() => queue.pop().map(Next::Run).unwrap_or(Next::Idle),
                Some(wait) => Next::Wait(wait),
                None => Next::Idle,
            }
        };

        match next {
            Next::Run(task) => run_task(&inner, task).await,
            Next::Wait(wait) => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(wait.min(Duration::from_millis(500))) => {}
                }
            }
            Next::Idle => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        }
    }
}

async fn run_task(inner: &Arc<SchedulerInner>, task: QueuedTask) {
    // Quiet-gated tasks yield to interactive use: re-enqueue, don't drop
    if task.kind.requires_quiet() && inner.activity.is_active() {
        debug!("Deferring {} while interactive", task.kind.name());
        let kind = task.kind;
        let attempt = task.attempt;
        inner.push(
            kind,
            Duration::from_millis(inner.config.requeue_delay_ms),
            attempt,
        );
        return;
    }

    // HIGH tasks never overlap; other priorities use the remaining workers
    let _high_permit = if task.kind.priority() == Priority::High {
        match inner.high_slot.acquire().await {
            Ok(permit) => Some(permit),
            Err(_) => return,
        }
    } else {
        None
    };

    inner.tasks_running.fetch_add(1, Ordering::Relaxed);
    let timeout = Duration::from_secs(inner.config.task_timeout_secs);
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, inner.executor.execute(&task.kind)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(EngineError::TaskTimeout(timeout)),
    };
    inner.tasks_running.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        Ok(()) => {
            debug!(
                "Task {} completed in {:?}",
                task.kind.name(),
                started.elapsed()
            );
            inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
            inner.last_completed.insert(task.kind.name().to_string(), Utc::now());
            inner.pending_keys.remove(&task.kind.dedup_key());
        }
        Err(e) => {
            let attempt = task.attempt + 1;
            if attempt > inner.config.max_retries {
                error!(
                    "Task {} failed permanently after {} attempts: {}",
                    task.kind.name(),
                    attempt,
                    e
                );
                inner.tasks_failed.fetch_add(1, Ordering::Relaxed);
                inner.pending_keys.remove(&task.kind.dedup_key());
            } else {
                let delay = backoff_delay(inner.config.retry_base_delay_ms, attempt);
                warn!(
                    "Task {} failed (attempt {}), retrying in {:?}: {}",
                    task.kind.name(),
                    attempt,
                    delay,
                    e
                );
                inner.tasks_retried.fetch_add(1, Ordering::Relaxed);
                inner.push(task.kind, delay, attempt);
            }
        }
    }
}

/// Exponential backoff with jitter. The jitter stays under a quarter of the
/// step, so successive delays are strictly increasing.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let step = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rand::thread_rng().gen_range(0..=step / 4);
    Duration::from_millis(step + jitter)
}
