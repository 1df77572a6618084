//! Serialized job execution for one connection.
//!
//! Every piece of per-connection protocol work (decoding, dialog callbacks,
//! flushing, timers) runs as a job on a [`ConnectionExecutor`]. Jobs may be
//! submitted from any thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, trace};

/// Unit of work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor a connection runs its jobs on
pub trait ConnectionExecutor: Send + Sync + 'static {
    /// Run `job` soon, after jobs submitted before it
    fn execute(&self, job: Job);

    /// Run `job` after `delay` unless `token` is cancelled first
    fn schedule(&self, delay: Duration, token: CancelToken, job: Job);

    /// Monotonic clock in milliseconds
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag for scheduled jobs
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<TokenInner>);

impl CancelToken {
    /// Create an uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel; pending jobs guarded by this token will not run
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancelled
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Executor backed by a tokio task draining a job queue
pub struct TokioExecutor {
    tx: mpsc::UnboundedSender<Job>,
    runtime: tokio::runtime::Handle,
    start: tokio::time::Instant,
}

impl TokioExecutor {
    /// Create an executor on the current runtime
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Arc<Self> {
        Self::with_handle(tokio::runtime::Handle::current())
    }

    /// Create an executor on `runtime`
    pub fn with_handle(runtime: tokio::runtime::Handle) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                // a panicking job must not take the rest of the queue down
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Connection job panicked");
                }
            }
            trace!("Executor queue closed");
        });
        Arc::new(Self {
            tx,
            runtime,
            start: tokio::time::Instant::now(),
        })
    }
}

impl ConnectionExecutor for TokioExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            trace!("Dropping job submitted after executor shutdown");
        }
    }

    fn schedule(&self, delay: Duration, token: CancelToken, job: Job) {
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        let _ = tx.send(job);
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

struct Timer {
    deadline: u64,
    seq: u64,
    token: CancelToken,
    job: Job,
}

#[derive(Default)]
struct ManualState {
    queue: VecDeque<Job>,
    timers: Vec<Timer>,
    now: u64,
    seq: u64,
}

/// Deterministic executor with a virtual clock
///
/// Nothing runs until [`run_pending`](Self::run_pending) or
/// [`advance`](Self::advance) is called, which makes interleavings
/// reproducible in tests and embedders that drive their own loop.
#[derive(Default)]
pub struct ManualExecutor {
    state: Mutex<ManualState>,
}

impl ManualExecutor {
    /// Create an idle executor at time zero
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run queued jobs, including ones they submit, until the queue is empty
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.lock().queue.pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Move the clock forward, firing due timers in deadline order
    pub fn advance(&self, delta: Duration) -> usize {
        let target = self.lock().now + delta.as_millis() as u64;
        let mut ran = self.run_pending();
        loop {
            let due = {
                let mut state = self.lock();
                state.timers.retain(|t| !t.token.is_cancelled());
                let next = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.seq))
                    .map(|(i, _)| i);
                next.map(|i| {
                    let timer = state.timers.swap_remove(i);
                    state.now = state.now.max(timer.deadline);
                    timer.job
                })
            };
            match due {
                Some(job) => {
                    job();
                    ran += 1 + self.run_pending();
                }
                None => break,
            }
        }
        self.lock().now = target;
        ran
    }

    /// Timers that are armed and not cancelled
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.token.is_cancelled())
            .count()
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

impl ConnectionExecutor for ManualExecutor {
    fn execute(&self, job: Job) {
        self.lock().queue.push_back(job);
    }

    fn schedule(&self, delay: Duration, token: CancelToken, job: Job) {
        let mut state = self.lock();
        let deadline = state.now + delay.as_millis() as u64;
        state.seq += 1;
        let seq = state.seq;
        state.timers.push(Timer {
            deadline,
            seq,
            token,
            job,
        });
    }

    fn now_millis(&self) -> u64 {
        self.lock().now
    }
}
