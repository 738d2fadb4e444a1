//! Admission-controlled task queue.
//!
//! Work enters through [`AdmissionQueue::submit`]: a task is either rejected
//! immediately (fail-fast backpressure once the queue is at capacity),
//! queued in priority order, or dispatched as soon as a concurrency slot is
//! free. A queued task that is not dispatched before its completion timeout
//! is rejected with a timeout error.
//!
//! Each task settles exactly once. The dispatch path and the timeout path
//! both claim the task's terminal flag under the queue lock, so a task
//! marked terminal by its timeout can never also be dispatched.

use crate::config::QueueConfig;
use crate::errors::DispatchError;
use crate::metrics_defs::{
    QUEUE_ACTIVE, QUEUE_PENDING, QUEUE_REJECTED, QUEUE_SUBMITTED, QUEUE_TASK_DURATION,
};
use parking_lot::Mutex;
use shared::{counter, gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const LATENCY_EMA_ALPHA: f64 = 0.2;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type RejectFn = Box<dyn FnOnce(DispatchError) + Send>;

struct QueuedTask {
    priority: i32,
    seq: u64,
    terminal: AtomicBool,
    run: Mutex<Option<TaskFuture>>,
    reject: Mutex<Option<RejectFn>>,
}

impl QueuedTask {
    /// Marks the task terminal. Only the caller that wins the claim may
    /// settle the task.
    fn try_claim(&self) -> bool {
        self.terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Rolling latency summary: exponential moving average plus observed bounds.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatencySummary {
    pub ema_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub samples: u64,
}

impl LatencySummary {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        if self.samples == 0 {
            self.ema_ms = ms;
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.ema_ms = LATENCY_EMA_ALPHA * ms + (1.0 - LATENCY_EMA_ALPHA) * self.ema_ms;
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.samples += 1;
    }
}

struct QueueState {
    /// Priority-ordered pending tasks; highest priority first, FIFO within
    /// a priority. Maintained by a single insertion rule, never re-sorted.
    pending: Vec<Arc<QueuedTask>>,
    active: usize,
    next_seq: u64,
    latency: LatencySummary,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    rejected: AtomicU64,
    processed: AtomicU64,
    shutting_down: AtomicBool,
    metrics_running: AtomicBool,
}

/// Point-in-time view of the queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub active: usize,
    pub rejected: u64,
    pub processed: u64,
    pub latency: LatencySummary,
}

#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(mut config: QueueConfig) -> Self {
        config.clamp();
        AdmissionQueue {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    active: 0,
                    next_seq: 0,
                    latency: LatencySummary::default(),
                }),
                rejected: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                metrics_running: AtomicBool::new(false),
            }),
        }
    }

    /// Submits `op` for execution. Fails immediately with `QueueFull` once
    /// the number of pending plus active tasks has reached the queue
    /// capacity, and with `QueueTimeout` if the task is still queued when
    /// its completion timeout fires.
    pub async fn submit<T, F, Fut>(&self, priority: i32, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DispatchError>> + Send + 'static,
        T: Send + 'static,
    {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(DispatchError::ShuttingDown);
        }

        let (tx, rx) = oneshot::channel::<Result<T, DispatchError>>();
        let sender = Arc::new(Mutex::new(Some(tx)));

        let run_sender = Arc::clone(&sender);
        let run_inner = Arc::clone(inner);
        let run: TaskFuture = Box::pin(async move {
            let started = Instant::now();
            let result = op().await;
            // Record completion before resolving the waiter so a caller
            // never observes its own finished task as unprocessed
            run_inner.complete(started.elapsed());
            if let Some(tx) = run_sender.lock().take() {
                let _ = tx.send(result);
            }
        });
        let reject: RejectFn = Box::new(move |err| {
            if let Some(tx) = sender.lock().take() {
                let _ = tx.send(Err(err));
            }
        });

        let task = {
            let mut state = inner.state.lock();
            if state.pending.len() + state.active >= inner.config.max_queue_len {
                drop(state);
                inner.rejected.fetch_add(1, Ordering::Relaxed);
                counter!(QUEUE_REJECTED).increment(1);
                return Err(DispatchError::QueueFull);
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let task = Arc::new(QueuedTask {
                priority,
                seq,
                terminal: AtomicBool::new(false),
                run: Mutex::new(Some(run)),
                reject: Mutex::new(Some(reject)),
            });

            let position = state.pending.partition_point(|t| t.priority >= priority);
            state.pending.insert(position, Arc::clone(&task));
            task
        };
        counter!(QUEUE_SUBMITTED).increment(1);

        // Arm the completion timeout; it loses the claim harmlessly if the
        // task is dispatched first.
        {
            let inner = Arc::clone(inner);
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.task_timeout()).await;
                inner.expire(&task);
            });
        }

        inner.ensure_metrics_loop();
        inner.pump();

        rx.await
            .unwrap_or_else(|_| Err(DispatchError::Internal("task settled without a result".into())))
    }

    /// Stops accepting new work and rejects everything still pending.
    /// Tasks already executing run to completion.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let claimed: Vec<Arc<QueuedTask>> = {
            let mut state = self.inner.state.lock();
            let drained = std::mem::take(&mut state.pending);
            drained.into_iter().filter(|task| task.try_claim()).collect()
        };

        for task in claimed {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            counter!(QUEUE_REJECTED).increment(1);
            if let Some(reject) = task.reject.lock().take() {
                reject(DispatchError::ShuttingDown);
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            pending: state.pending.len(),
            active: state.active,
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            latency: state.latency,
        }
    }
}

impl QueueInner {
    /// Dispatches pending tasks while concurrency slots are free.
    fn pump(self: &Arc<Self>) {
        loop {
            let run = {
                let mut state = self.state.lock();
                if state.active >= self.config.max_concurrency {
                    return;
                }

                let mut claimed = None;
                while !state.pending.is_empty() {
                    let candidate = state.pending.remove(0);
                    if candidate.try_claim() {
                        claimed = Some(candidate);
                        break;
                    }
                    // Lost the claim to its timeout; already settled there
                }
                let Some(task) = claimed else {
                    return;
                };
                state.active += 1;
                task.run.lock().take()
            };

            let Some(run) = run else {
                // A claimed task always still holds its run future; recover
                // the slot if that ever breaks
                tracing::error!("claimed task had no run future");
                self.state.lock().active -= 1;
                continue;
            };

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                // Spawned separately so a panicking task surfaces as a join
                // error instead of poisoning the scheduler
                if let Err(err) = tokio::spawn(run).await {
                    tracing::error!("queued task panicked: {err}");
                }
                inner.release_slot();
            });
        }
    }

    /// Timeout path: claims and removes the task if it has not started.
    fn expire(&self, task: &QueuedTask) {
        {
            let mut state = self.state.lock();
            if !task.try_claim() {
                return;
            }
            if let Some(position) = state.pending.iter().position(|t| t.seq == task.seq) {
                state.pending.remove(position);
            }
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!(QUEUE_REJECTED).increment(1);
        if let Some(reject) = task.reject.lock().take() {
            reject(DispatchError::QueueTimeout);
        }
    }

    fn complete(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        histogram!(QUEUE_TASK_DURATION).record(elapsed.as_secs_f64());
        self.state.lock().latency.record(elapsed);
    }

    fn release_slot(self: &Arc<Self>) {
        self.state.lock().active -= 1;
        self.pump();
    }

    /// Starts the periodic metrics emission if it is not already running.
    /// The loop stops itself as soon as the queue goes idle so an idle
    /// queue carries no timer.
    fn ensure_metrics_loop(self: &Arc<Self>) {
        if self.config.metrics_interval_secs == 0 {
            return;
        }
        if self
            .metrics_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(inner.config.metrics_interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                let (pending, active) = {
                    let state = inner.state.lock();
                    (state.pending.len(), state.active)
                };
                if pending == 0 && active == 0 {
                    inner.metrics_running.store(false, Ordering::Release);
                    return;
                }
                gauge!(QUEUE_PENDING).set(pending as f64);
                gauge!(QUEUE_ACTIVE).set(active as f64);
                counter!(QUEUE_REJECTED).absolute(inner.rejected.load(Ordering::Relaxed));
            }
        });
    }
}
