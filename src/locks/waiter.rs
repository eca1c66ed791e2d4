//! Local wait queue and the blocking acquisition loop.

use crate::error::{Error, Result};
use crate::locks::owner::LockOwner;
use crate::metrics::LockMetrics;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A single blocked thread.
#[derive(Debug, Default)]
struct Waiter {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    fn signal(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_one();
    }

    /// Sleep until signalled or `timeout` elapses. Consumes the signal.
    fn park(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            self.cond.wait_for(&mut signalled, timeout);
        }
        std::mem::replace(&mut *signalled, false)
    }
}

/// Threads of this member waiting on one lock, keyed by owner.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: Mutex<HashMap<LockOwner, Arc<Waiter>>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register<'a>(&'a self, owner: LockOwner, metrics: &'a LockMetrics) -> Registration<'a> {
        let waiter = Arc::new(Waiter::default());
        self.waiters.lock().insert(owner, waiter.clone());
        metrics.wait_started();
        Registration {
            queue: self,
            metrics,
            owner,
            waiter,
        }
    }

    /// Wake the thread waiting as `owner`, if any.
    pub(crate) fn signal(&self, owner: &LockOwner) -> bool {
        let waiter = self.waiters.lock().get(owner).cloned();
        match waiter {
            Some(waiter) => {
                waiter.signal();
                true
            }
            None => false,
        }
    }

    /// Wake every waiting thread.
    pub(crate) fn signal_all(&self) {
        let waiters: Vec<_> = self.waiters.lock().values().cloned().collect();
        for waiter in waiters {
            waiter.signal();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    pub(crate) fn contains_thread(&self, thread_id: u64) -> bool {
        self.waiters
            .lock()
            .keys()
            .any(|owner| owner.thread_id() == thread_id)
    }
}

/// Removes the waiter from its queue when dropped.
struct Registration<'a> {
    queue: &'a WaitQueue,
    metrics: &'a LockMetrics,
    owner: LockOwner,
    waiter: Arc<Waiter>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.queue.waiters.lock().remove(&self.owner);
        self.metrics.wait_finished();
    }
}

/// The store-side half of an acquisition, implemented by each lock facade.
pub(crate) trait RemoteAcquire {
    /// Lock name, for logging.
    fn lock_name(&self) -> &str;

    /// First request: grant or queue `owner`.
    fn attempt(&self, owner: LockOwner) -> bool;

    /// Retry after a wake-up. Must treat a grant made by succession as
    /// success rather than locking again.
    fn confirm(&self, owner: LockOwner) -> bool;

    /// Withdraw the queued request. Returns `true` if `owner` was granted
    /// the lock before the request could be withdrawn.
    fn abandon(&self, owner: LockOwner) -> bool;

    /// Release a grant that arrived too late to be used.
    fn release(&self, owner: LockOwner) -> bool;
}

/// Parameters shared by every acquisition of a lock handle.
pub(crate) struct AcquireContext<'a> {
    pub waiters: &'a WaitQueue,
    pub metrics: &'a LockMetrics,
    pub poll_interval: Duration,
}

/// Deadline `timeout` from now. `None` when the sum does not fit in an
/// `Instant`, which is treated as waiting without a deadline.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

enum WaitOutcome {
    Granted,
    TimedOut,
    Cancelled,
}

/// Acquire through the store, blocking the calling thread while queued.
///
/// Returns `Ok(true)` once granted, `Ok(false)` if `deadline` passed and
/// [`Error::Interrupted`] if `cancel` fired. On the negative outcomes the
/// queued request has been withdrawn from the holder.
pub(crate) fn acquire_remote<R: RemoteAcquire + ?Sized>(
    remote: &R,
    ctx: &AcquireContext<'_>,
    owner: LockOwner,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
) -> Result<bool> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        ctx.metrics.record_interrupted();
        return Err(Error::Interrupted);
    }

    if remote.attempt(owner) {
        ctx.metrics.record_acquired(None);
        return Ok(true);
    }

    let started = Instant::now();
    debug!(lock = remote.lock_name(), %owner, "Lock contended, waiting");

    let outcome = {
        let registration = ctx.waiters.register(owner, ctx.metrics);
        loop {
            // registered before retrying, so a grant in between is not missed
            if remote.confirm(owner) {
                break WaitOutcome::Granted;
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                break WaitOutcome::Cancelled;
            }
            let mut slice = ctx.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break WaitOutcome::TimedOut;
                }
                slice = slice.min(deadline - now);
            }
            registration.waiter.park(slice);
        }
    };

    match outcome {
        WaitOutcome::Granted => {
            ctx.metrics.record_acquired(Some(started.elapsed()));
            debug!(lock = remote.lock_name(), %owner, waited = ?started.elapsed(), "Lock granted");
            Ok(true)
        }
        WaitOutcome::TimedOut => {
            if remote.abandon(owner) {
                ctx.metrics.record_acquired(Some(started.elapsed()));
                return Ok(true);
            }
            ctx.metrics.record_timeout();
            debug!(lock = remote.lock_name(), %owner, "Timed out waiting for lock");
            Ok(false)
        }
        WaitOutcome::Cancelled => {
            if remote.abandon(owner) {
                remote.release(owner);
            }
            ctx.metrics.record_interrupted();
            debug!(lock = remote.lock_name(), %owner, "Interrupted waiting for lock");
            Err(Error::Interrupted)
        }
    }
}
