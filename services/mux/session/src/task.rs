//! One-shot and periodic tasks on a connection executor.

use crate::executor::{CancelToken, ConnectionExecutor};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Handle to a scheduled job; cancelling stops any further runs
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancelToken,
}

impl ScheduledTask {
    /// Run `f` once after `delay`
    pub fn once<F>(executor: &Arc<dyn ConnectionExecutor>, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancelToken::new();
        executor.schedule(delay, token.clone(), Box::new(f));
        Self { token }
    }

    /// Run `f` every `period`, first after `period`, until cancelled
    pub fn periodic<F>(executor: &Arc<dyn ConnectionExecutor>, period: Duration, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let token = CancelToken::new();
        arm(Arc::downgrade(executor), period, token.clone(), Arc::new(f));
        Self { token }
    }

    /// Stop the task
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn arm(
    executor: Weak<dyn ConnectionExecutor>,
    period: Duration,
    token: CancelToken,
    f: Arc<dyn Fn() + Send + Sync>,
) {
    let Some(exec) = executor.upgrade() else {
        return;
    };
    let guard = token.clone();
    exec.schedule(
        period,
        guard,
        Box::new(move || {
            if token.is_cancelled() {
                return;
            }
            f();
            if !token.is_cancelled() {
                arm(executor, period, token, f);
            }
        }),
    );
}
