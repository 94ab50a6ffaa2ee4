//! External operation queue.
//!
//! Every outbound call to the chat platform (message sends and edits) goes
//! through one FIFO queue. Operations run strictly one at a time, in
//! enqueue order, with an adaptive pause between them:
//!
//! - success relaxes the spacing toward the base window (multiplicative
//!   decay, never below base)
//! - a rate-limit failure multiplies the spacing (capped at the maximum)
//! - a long stretch without any success while failures keep piling up
//!   forces the spacing upward no matter what the last call returned
//! - a large healthy backlog halves the pause (never below the minimum)
//!
//! The queue never retries. A failed operation is reported to whoever
//! enqueued it; re-enqueueing is the caller's decision.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, WagerError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Resting pause between two operations.
    pub base_spacing: Duration,
    /// Floor for the backlog-shortened pause.
    pub min_spacing: Duration,
    /// Ceiling for any backoff.
    pub max_spacing: Duration,
    /// Without a success for this long, repeated failures force backoff.
    pub stall_after: Duration,
    /// Consecutive failures needed before the stall rule applies.
    pub stall_failure_threshold: u32,
    /// Pending operations above which the pause is shortened.
    pub backlog_threshold: usize,
    /// Spacing multiplier applied after each success (< 1).
    pub success_decay: f64,
    /// Spacing multiplier applied after a rate-limit failure (> 1).
    pub rate_limit_growth: f64,
    /// Spacing multiplier applied when the stall rule fires (> 1).
    pub stall_growth: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_spacing: Duration::from_millis(500),
            min_spacing: Duration::from_millis(100),
            max_spacing: Duration::from_secs(10),
            stall_after: Duration::from_secs(30),
            stall_failure_threshold: 5,
            backlog_threshold: 10,
            success_decay: 0.8,
            rate_limit_growth: 2.0,
            stall_growth: 1.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Pacer
// ---------------------------------------------------------------------------

/// Outcome of one executed operation, as far as pacing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Succeeded,
    RateLimited { retry_after: Option<Duration> },
    Failed,
}

impl Attempt {
    fn of<T>(result: &Result<T, ChannelError>) -> Self {
        match result {
            Ok(_) => Attempt::Succeeded,
            Err(ChannelError::RateLimited { retry_after }) => Attempt::RateLimited {
                retry_after: *retry_after,
            },
            Err(ChannelError::Failed(_)) => Attempt::Failed,
        }
    }
}

/// Adaptive spacing between queued operations.
#[derive(Debug, Clone)]
pub struct Pacer {
    config: QueueConfig,
    spacing: Duration,
    consecutive_failures: u32,
    last_success: Instant,
}

impl Pacer {
    pub fn new(config: QueueConfig, now: Instant) -> Self {
        Self {
            spacing: config.base_spacing,
            config,
            consecutive_failures: 0,
            last_success: now,
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Fold the outcome of one operation into the spacing.
    pub fn record(&mut self, attempt: Attempt, now: Instant) {
        match attempt {
            Attempt::Succeeded => {
                self.consecutive_failures = 0;
                self.last_success = now;
                self.spacing = self
                    .spacing
                    .mul_f64(self.config.success_decay)
                    .max(self.config.base_spacing);
                return;
            }
            Attempt::RateLimited { retry_after } => {
                self.consecutive_failures += 1;
                let grown = self.spacing.mul_f64(self.config.rate_limit_growth);
                self.spacing = grown
                    .max(retry_after.unwrap_or_default())
                    .min(self.config.max_spacing);
            }
            Attempt::Failed => {
                self.consecutive_failures += 1;
            }
        }

        let starved = now.saturating_duration_since(self.last_success) >= self.config.stall_after;
        if starved && self.consecutive_failures >= self.config.stall_failure_threshold {
            let forced = self
                .spacing
                .mul_f64(self.config.stall_growth)
                .max(self.config.base_spacing.mul_f64(self.config.stall_growth));
            self.spacing = forced.min(self.config.max_spacing);
        }
    }

    /// Pause to take before the next operation given the current backlog.
    /// Only a healthy queue (no failure streak) is drained faster.
    pub fn delay(&self, backlog: usize) -> Duration {
        if backlog > self.config.backlog_threshold && self.consecutive_failures == 0 {
            (self.spacing / 2).max(self.config.min_spacing)
        } else {
            self.spacing
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() -> BoxFuture<'static, Attempt> + Send>;

struct QueuedJob {
    id: u64,
    label: String,
    job: Job,
}

struct QueueState {
    pending: VecDeque<QueuedJob>,
    running: Option<String>,
    closed: bool,
    pacer: Pacer,
    next_id: u64,
    executed: u64,
    failed: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    /// Pending plus running operations.
    outstanding: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: Option<String>,
    pub spacing: Duration,
    pub consecutive_failures: u32,
    pub executed: u64,
    pub failed: u64,
}

/// Handle to the serialized executor. Clones share the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl OperationQueue {
    /// Create the queue and spawn its worker on the current runtime.
    pub fn start(config: QueueConfig) -> Self {
        let (outstanding, _) = watch::channel(0usize);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: None,
                closed: false,
                pacer: Pacer::new(config, Instant::now()),
                next_id: 1,
                executed: 0,
                failed: 0,
            }),
            wake: Notify::new(),
            outstanding,
            shutdown,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(run_worker(shared.clone()));
        *shared.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Self { shared }
    }

    /// Append an operation to the tail of the queue. The returned future
    /// resolves with the operation's own result once it has run, or with
    /// `QueueCleared` if it is dropped before running.
    pub fn enqueue<T, F, Fut>(&self, label: impl Into<String>, operation: F) -> Queued<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ChannelError>> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let result = operation().await;
                let attempt = Attempt::of(&result);
                // the caller may have stopped waiting
                let _ = tx.send(result);
                attempt
            }
            .boxed()
        });

        let mut state = self.shared.lock();
        if state.closed {
            debug!(label = %label, "Queue closed, rejecting operation");
            return Queued { rx, label };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push_back(QueuedJob { id, label: label.clone(), job });
        let backlog = state.pending.len();
        // counted under the lock so the worker can never decrement first
        self.shared.outstanding.send_modify(|n| *n += 1);
        drop(state);

        self.shared.wake.notify_one();
        debug!(op_id = id, label = %label, backlog, "Operation enqueued");
        Queued { rx, label }
    }

    /// Fail every operation that has not started yet. Returns how many
    /// were dropped. The running operation, if any, is unaffected.
    pub fn clear(&self) -> usize {
        let dropped: Vec<QueuedJob> = {
            let mut state = self.shared.lock();
            let dropped: Vec<QueuedJob> = state.pending.drain(..).collect();
            if !dropped.is_empty() {
                let count = dropped.len();
                self.shared.outstanding.send_modify(|n| *n = n.saturating_sub(count));
            }
            dropped
        };
        let count = dropped.len();
        if count > 0 {
            warn!(count, "Operation queue cleared");
        }
        // dropping the jobs drops their result senders
        drop(dropped);
        count
    }

    /// Stop accepting work, clear the backlog, and wait for the worker to
    /// finish the operation it is running.
    pub async fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.clear();
        self.shared.shutdown.send_replace(true);
        self.shared.wake.notify_one();

        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue worker ended abnormally");
            }
        }
        info!("Operation queue shut down");
    }

    /// Resolve once nothing is pending or running.
    pub async fn idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        // a closed channel means the queue is gone, which is idle enough
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        QueueStats {
            pending: state.pending.len(),
            running: state.running.clone(),
            spacing: state.pacer.spacing(),
            consecutive_failures: state.pacer.consecutive_failures(),
            executed: state.executed,
            failed: state.failed,
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    debug!("Queue worker started");

    loop {
        let next = {
            let mut state = shared.lock();
            if state.closed && state.pending.is_empty() {
                break;
            }
            let next = state.pending.pop_front();
            if let Some(item) = &next {
                state.running = Some(item.label.clone());
            }
            next
        };

        let Some(item) = next else {
            shared.wake.notified().await;
            continue;
        };

        let started = Instant::now();
        let attempt = match AssertUnwindSafe((item.job)()).catch_unwind().await {
            Ok(attempt) => attempt,
            Err(_) => {
                error!(op_id = item.id, label = %item.label, "Queued operation panicked");
                Attempt::Failed
            }
        };

        let delay = {
            let mut state = shared.lock();
            state.running = None;
            state.pacer.record(attempt, Instant::now());
            if attempt == Attempt::Succeeded {
                state.executed += 1;
            } else {
                state.failed += 1;
            }
            shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            state.pacer.delay(state.pending.len())
        };

        match attempt {
            Attempt::Succeeded => debug!(
                op_id = item.id,
                label = %item.label,
                elapsed_ms = started.elapsed().as_millis() as u64,
                next_delay_ms = delay.as_millis() as u64,
                "Operation completed"
            ),
            _ => warn!(
                op_id = item.id,
                label = %item.label,
                outcome = ?attempt,
                next_delay_ms = delay.as_millis() as u64,
                "Operation failed"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!("Queue worker stopped");
}

// ---------------------------------------------------------------------------
// Result handle
// ---------------------------------------------------------------------------

/// Eventual result of a queued operation.
#[must_use = "a queued operation's result should be awaited or explicitly dropped"]
pub struct Queued<T> {
    rx: oneshot::Receiver<Result<T, ChannelError>>,
    label: String,
}

impl<T> Queued<T> {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Future for Queued<T> {
    type Output = Result<T, WagerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(WagerError::ExternalChannel(e)),
            Err(_) => Err(WagerError::QueueCleared),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
