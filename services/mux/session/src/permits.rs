//! Shared inbound dialog permits.
//!
//! Every remotely started dialog holds one permit from the time its start
//! message is read until it finishes. When the pool runs dry the endpoint
//! stops reading; permits freed later are granted to waiting endpoints in
//! FIFO order.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

/// Endpoint side of a permit pool
pub trait PermitHandle: Send + Sync {
    /// Take one permit; on failure the caller is queued for a later grant
    fn reserve(&self) -> bool;

    /// Return `n` permits
    fn free(&self, n: u32);

    /// Leave the wait queue; later grants go elsewhere
    fn close(&self) {}
}

/// Receiver of deferred grants
pub trait PermitListener: Send + Sync {
    /// `n` permits now belong to the listener
    fn on_permits_granted(&self, n: u32);
}

/// Handle that never runs out
#[derive(Debug, Default)]
pub struct UnlimitedPermits;

impl PermitHandle for UnlimitedPermits {
    fn reserve(&self) -> bool {
        true
    }

    fn free(&self, _n: u32) {}
}

#[derive(Debug)]
struct PoolState {
    available: u32,
    waiters: VecDeque<u64>,
}

/// Permit snapshot for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitStats {
    /// Configured capacity
    pub capacity: u32,
    /// Permits currently unreserved
    pub available: u32,
    /// Endpoints waiting for a grant
    pub waiting: usize,
    /// Total successful reservations, grants included
    pub reserved_total: u64,
    /// Total permits returned
    pub freed_total: u64,
}

/// Pool shared by all endpoints of one process or listener
pub struct PermitPool {
    capacity: u32,
    state: Mutex<PoolState>,
    listeners: DashMap<u64, Weak<dyn PermitListener>>,
    reserved_total: AtomicU64,
    freed_total: AtomicU64,
}

impl PermitPool {
    /// Pool holding `capacity` permits
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(PoolState {
                available: capacity,
                waiters: VecDeque::new(),
            }),
            listeners: DashMap::new(),
            reserved_total: AtomicU64::new(0),
            freed_total: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for endpoint `id`; grants go to `listener`
    pub fn register(self: &Arc<Self>, id: u64, listener: Weak<dyn PermitListener>) -> Arc<PoolHandle> {
        self.listeners.insert(id, listener);
        Arc::new(PoolHandle {
            pool: self.clone(),
            id,
        })
    }

    /// Forget endpoint `id`
    pub fn unregister(&self, id: u64) {
        self.listeners.remove(&id);
        self.lock().waiters.retain(|w| *w != id);
    }

    /// Current counters
    pub fn stats(&self) -> PermitStats {
        let state = self.lock();
        PermitStats {
            capacity: self.capacity,
            available: state.available,
            waiting: state.waiters.len(),
            reserved_total: self.reserved_total.load(Ordering::Relaxed),
            freed_total: self.freed_total.load(Ordering::Relaxed),
        }
    }

    /// Permits currently unreserved
    pub fn available(&self) -> u32 {
        self.lock().available
    }

    fn reserve(&self, id: u64) -> bool {
        let mut state = self.lock();
        if state.available > 0 {
            state.available -= 1;
            self.reserved_total.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            if !state.waiters.contains(&id) {
                state.waiters.push_back(id);
            }
            trace!("Endpoint {} waiting for a dialog permit", id);
            false
        }
    }

    fn free(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.freed_total.fetch_add(u64::from(n), Ordering::Relaxed);
        let mut pending = n;
        loop {
            // Grant outside the lock; listeners may re-enter the pool.
            let grant = {
                let mut state = self.lock();
                state.available = (state.available + pending).min(self.capacity);
                pending = 0;
                match state.waiters.front().copied() {
                    Some(id) if state.available > 0 => {
                        state.waiters.pop_front();
                        state.available -= 1;
                        Some(id)
                    }
                    _ => None,
                }
            };
            let Some(id) = grant else {
                return;
            };
            let listener = self.listeners.get(&id).and_then(|l| l.upgrade());
            match listener {
                Some(listener) => {
                    self.reserved_total.fetch_add(1, Ordering::Relaxed);
                    debug!("Granted dialog permit to endpoint {}", id);
                    listener.on_permits_granted(1);
                }
                None => {
                    trace!("Endpoint {} went away before its grant", id);
                    pending = 1;
                }
            }
        }
    }
}

/// Registration of one endpoint in a [`PermitPool`]
pub struct PoolHandle {
    pool: Arc<PermitPool>,
    id: u64,
}

impl PermitHandle for PoolHandle {
    fn reserve(&self) -> bool {
        self.pool.reserve(self.id)
    }

    fn free(&self, n: u32) {
        self.pool.free(n)
    }

    fn close(&self) {
        self.pool.unregister(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counter {
        granted: AtomicU32,
    }

    impl PermitListener for Counter {
        fn on_permits_granted(&self, n: u32) {
            self.granted.fetch_add(n, Ordering::SeqCst);
        }
    }

    fn listener(counter: &Arc<Counter>) -> Weak<dyn PermitListener> {
        let as_dyn: Arc<dyn PermitListener> = counter.clone();
        Arc::downgrade(&as_dyn)
    }

    #[test]
    fn test_reserve_and_free() {
        let pool = PermitPool::new(2);
        let counter = Arc::new(Counter::default());
        let handle = pool.register(1, listener(&counter));

        assert!(handle.reserve());
        assert!(handle.reserve());
        assert!(!handle.reserve());
        assert_eq!(pool.stats().waiting, 1);

        // freed permit goes straight to the waiter
        handle.free(1);
        assert_eq!(counter.granted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 0);

        handle.free(2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[test]
    fn test_fifo_grants() {
        let pool = PermitPool::new(1);
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let ha = pool.register(1, listener(&a));
        let hb = pool.register(2, listener(&b));

        assert!(ha.reserve());
        assert!(!hb.reserve());
        assert!(!ha.reserve());

        ha.free(1);
        assert_eq!(b.granted.load(Ordering::SeqCst), 1);
        assert_eq!(a.granted.load(Ordering::SeqCst), 0);

        hb.free(1);
        assert_eq!(a.granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_grant_skips_dropped_listener() {
        let pool = PermitPool::new(1);
        let gone = Arc::new(Counter::default());
        let alive = Arc::new(Counter::default());
        let h1 = pool.register(1, listener(&gone));
        let h2 = pool.register(2, listener(&alive));

        assert!(h2.reserve());
        assert!(!h1.reserve());
        assert!(!h2.reserve());
        drop(gone);

        h2.free(1);
        assert_eq!(alive.granted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_close_leaves_queue() {
        let pool = PermitPool::new(1);
        let counter = Arc::new(Counter::default());
        let h1 = pool.register(1, listener(&counter));
        let h2 = pool.register(2, listener(&counter));

        assert!(h1.reserve());
        assert!(!h2.reserve());
        h2.close();

        h1.free(1);
        assert_eq!(counter.granted.load(Ordering::SeqCst), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_unlimited() {
        let permits = UnlimitedPermits;
        for _ in 0..1000 {
            assert!(permits.reserve());
        }
        permits.free(1000);
    }
}
