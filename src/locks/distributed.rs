//! Client-side handle for an exclusive cluster lock.

use crate::config::LocksConfig;
use crate::error::{Error, Result};
use crate::locks::exclusive::ExclusiveLockHolder;
use crate::locks::owner::{current_thread_id, LockOwner};
use crate::locks::waiter::{
    acquire_remote, deadline_after, AcquireContext, RemoteAcquire, WaitQueue,
};
use crate::locks::{update_holder, Lock};
use crate::metrics::LockMetrics;
use crate::store::{MapEvent, NamedMap};
use crate::types::MemberId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which local thread holds the lock, and how many times.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LocalHold {
    thread_id: Option<u64>,
    count: u32,
}

impl LocalHold {
    pub(crate) fn is_held_by(&self, thread_id: u64) -> bool {
        self.thread_id == Some(thread_id)
    }

    pub(crate) fn count_for(&self, thread_id: u64) -> u32 {
        if self.is_held_by(thread_id) {
            self.count
        } else {
            0
        }
    }

    /// Add a reentrant hold if `thread_id` already owns the lock.
    pub(crate) fn reenter(&mut self, thread_id: u64) -> bool {
        if self.is_held_by(thread_id) {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn grant(&mut self, thread_id: u64) {
        self.thread_id = Some(thread_id);
        self.count = 1;
    }

    /// Drop one hold. `Some(true)` means the last hold is gone and the
    /// store must be told; `None` means `thread_id` held nothing.
    pub(crate) fn release(&mut self, thread_id: u64) -> Option<bool> {
        if !self.is_held_by(thread_id) {
            return None;
        }
        self.count -= 1;
        if self.count == 0 {
            *self = Self::default();
            Some(true)
        } else {
            Some(false)
        }
    }
}

/// An exclusive, reentrant lock shared by every member of the cluster.
///
/// The lock is owned by a thread of a member. Reentrant acquisitions are
/// counted locally and never touch the store; only the first acquisition
/// and the final release do.
pub struct DistributedLock {
    name: String,
    member_id: MemberId,
    client: bool,
    poll_interval: Duration,
    map: Arc<NamedMap<ExclusiveLockHolder>>,
    local: Mutex<LocalHold>,
    waiters: Arc<WaitQueue>,
    metrics: Arc<LockMetrics>,
}

impl DistributedLock {
    pub(crate) fn new(
        name: &str,
        map: Arc<NamedMap<ExclusiveLockHolder>>,
        config: &LocksConfig,
        metrics: Arc<LockMetrics>,
    ) -> Self {
        let waiters = Arc::new(WaitQueue::new());
        let listener_waiters = waiters.clone();
        map.add_key_listener(
            name,
            Arc::new(move |event: &MapEvent<ExclusiveLockHolder>| {
                wake_successor(&listener_waiters, event)
            }),
        );

        Self {
            name: name.to_string(),
            member_id: config.member_id,
            client: config.client,
            poll_interval: config.poll_interval,
            map,
            local: Mutex::new(LocalHold::default()),
            waiters,
            metrics,
        }
    }

    /// Name of the lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any thread of any member holds the lock.
    pub fn is_locked(&self) -> bool {
        self.holder().is_some_and(|h| h.is_locked())
    }

    /// Whether the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.local.lock().is_held_by(current_thread_id())
    }

    /// Number of holds the calling thread has on the lock.
    pub fn hold_count(&self) -> u32 {
        self.local.lock().count_for(current_thread_id())
    }

    /// Current owner, if the lock is held.
    pub fn owner(&self) -> Option<LockOwner> {
        self.holder().and_then(|h| h.owner())
    }

    /// Owners queued for the lock across the cluster, in grant order.
    pub fn pending_owners(&self) -> Vec<LockOwner> {
        self.holder()
            .map(|h| h.pending().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any local thread is waiting for the lock.
    pub fn has_queued_threads(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Whether the local thread `thread_id` is waiting for the lock.
    pub fn has_queued_thread(&self, thread_id: u64) -> bool {
        self.waiters.contains_thread(thread_id)
    }

    /// Number of local threads waiting for the lock.
    pub fn queue_length(&self) -> usize {
        self.waiters.len()
    }

    /// Current holder state in the store.
    pub fn holder(&self) -> Option<ExclusiveLockHolder> {
        self.map.get(&self.name)
    }

    fn current_owner(&self) -> LockOwner {
        LockOwner::current(self.member_id, self.client)
    }

    fn update<R>(&self, f: impl FnOnce(&mut ExclusiveLockHolder) -> R) -> R {
        update_holder(&self.map, &self.name, f)
    }

    fn acquire(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let owner = self.current_owner();
        if self.local.lock().reenter(owner.thread_id()) {
            return Ok(true);
        }

        let ctx = AcquireContext {
            waiters: &self.waiters,
            metrics: &self.metrics,
            poll_interval: self.poll_interval,
        };
        let acquired = acquire_remote(self, &ctx, owner, deadline, cancel)?;
        if acquired {
            self.local.lock().grant(owner.thread_id());
        }
        Ok(acquired)
    }
}

impl RemoteAcquire for DistributedLock {
    fn lock_name(&self) -> &str {
        &self.name
    }

    fn attempt(&self, owner: LockOwner) -> bool {
        self.update(|h| h.lock(owner))
    }

    fn confirm(&self, owner: LockOwner) -> bool {
        self.update(|h| h.is_locked_by(owner) || h.lock(owner))
    }

    fn abandon(&self, owner: LockOwner) -> bool {
        self.update(|h| {
            if h.is_locked_by(owner) {
                true
            } else {
                h.cancel(owner);
                false
            }
        })
    }

    fn release(&self, owner: LockOwner) -> bool {
        self.update(|h| h.unlock(owner))
    }
}

impl Lock for DistributedLock {
    fn lock(&self) -> Result<()> {
        self.acquire(None, None).map(|_| ())
    }

    fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()> {
        self.acquire(None, Some(cancel)).map(|_| ())
    }

    fn try_lock(&self) -> Result<bool> {
        let owner = self.current_owner();
        if self.local.lock().reenter(owner.thread_id()) {
            return Ok(true);
        }
        if self.update(|h| h.try_lock(owner)) {
            self.local.lock().grant(owner.thread_id());
            self.metrics.record_acquired(None);
            return Ok(true);
        }
        Ok(false)
    }

    fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.acquire(deadline_after(timeout), None)
    }

    fn try_lock_for_interruptibly(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.acquire(deadline_after(timeout), Some(cancel))
    }

    fn unlock(&self) -> Result<()> {
        let owner = self.current_owner();
        let released = self.local.lock().release(owner.thread_id());
        match released {
            Some(false) => Ok(()),
            Some(true) => {
                if self.release(owner) {
                    self.metrics.record_released();
                    debug!(lock = %self.name, %owner, "Lock released");
                    Ok(())
                } else {
                    // the store no longer lists us, e.g. after member cleanup
                    self.metrics.record_illegal_unlock();
                    warn!(lock = %self.name, %owner, "Lock was not held in the grid");
                    Err(Error::not_held(&self.name, owner))
                }
            }
            None => {
                self.metrics.record_illegal_unlock();
                warn!(lock = %self.name, %owner, "Unlock by non-owner");
                Err(Error::not_held(&self.name, owner))
            }
        }
    }
}

impl fmt::Display for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner() {
            Some(owner) => write!(f, "DistributedLock{{name={}}}[Locked by {}]", self.name, owner),
            None => write!(f, "DistributedLock{{name={}}}[Unlocked]", self.name),
        }
    }
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("member_id", &self.member_id)
            .field("local", &*self.local.lock())
            .field("waiting", &self.waiters.len())
            .finish()
    }
}

/// Wake only the thread the holder now names as owner. A holder that is
/// unlocked or gone wakes everyone so they can compete again.
fn wake_successor(waiters: &WaitQueue, event: &MapEvent<ExclusiveLockHolder>) {
    match event.new_value.as_ref().and_then(|h| h.owner()) {
        Some(owner) => {
            waiters.signal(&owner);
        }
        None => waiters.signal_all(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EXCLUSIVE_LOCKS_MAP;
    use std::thread;

    fn new_lock(member_id: MemberId) -> (DistributedLock, Arc<NamedMap<ExclusiveLockHolder>>) {
        let map = Arc::new(NamedMap::new(EXCLUSIVE_LOCKS_MAP));
        let config = LocksConfig::new(member_id).with_poll_interval(Duration::from_millis(10));
        let lock = DistributedLock::new("orders", map.clone(), &config, Arc::new(LockMetrics::new()));
        (lock, map)
    }

    #[test]
    fn test_reentrant_lock_touches_store_once() {
        let (lock, map) = new_lock(1);

        lock.lock().unwrap();
        lock.lock().unwrap();
        assert_eq!(lock.hold_count(), 2);
        assert!(lock.is_held_by_current_thread());
        assert_eq!(map.get("orders").unwrap().hold_count(), 1);

        lock.unlock().unwrap();
        assert!(lock.is_locked());
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
        assert!(map.get("orders").is_none());
    }

    #[test]
    fn test_unlock_without_holding_is_illegal() {
        let (lock, _map) = new_lock(1);
        assert!(matches!(lock.unlock(), Err(Error::IllegalMonitorState(_))));
        assert_eq!(lock.metrics.illegal_unlocks.get(), 1);
    }

    #[test]
    fn test_try_lock_does_not_queue() {
        let (lock, map) = new_lock(1);
        let other = LockOwner::new(2, 77, false);
        update_holder(&map, "orders", |h| h.lock(other));

        assert!(!lock.try_lock().unwrap());
        assert_eq!(lock.pending_owners(), Vec::<LockOwner>::new());
        assert_eq!(lock.owner(), Some(other));
    }

    #[test]
    fn test_try_lock_for_times_out_and_withdraws() {
        let (lock, map) = new_lock(1);
        let other = LockOwner::new(2, 77, false);
        update_holder(&map, "orders", |h| h.lock(other));

        let started = Instant::now();
        assert!(!lock.try_lock_for(Duration::from_millis(50)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(lock.pending_owners().is_empty());
        assert_eq!(lock.metrics.timeouts.get(), 1);
        assert!(!lock.has_queued_threads());
    }

    #[test]
    fn test_waiter_granted_on_release() {
        let (lock, map) = new_lock(1);
        let lock = Arc::new(lock);
        let other = LockOwner::new(2, 77, false);
        update_holder(&map, "orders", |h| h.lock(other));

        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.lock().unwrap();
                let held = lock.is_held_by_current_thread();
                lock.unlock().unwrap();
                held
            })
        };

        while lock.pending_owners().is_empty() {
            thread::yield_now();
        }
        assert!(update_holder(&map, "orders", |h| h.unlock(other)));
        assert!(waiter.join().unwrap());
        assert!(!lock.is_locked());
        assert_eq!(lock.metrics.contended.get(), 1);
    }

    #[test]
    fn test_cancelled_waiter_leaves_no_request() {
        let (lock, map) = new_lock(1);
        let lock = Arc::new(lock);
        let other = LockOwner::new(2, 77, false);
        update_holder(&map, "orders", |h| h.lock(other));

        let cancel = CancellationToken::new();
        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            thread::spawn(move || lock.lock_interruptibly(&cancel))
        };

        while !lock.has_queued_threads() {
            thread::yield_now();
        }
        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
        assert!(lock.pending_owners().is_empty());
        assert_eq!(lock.owner(), Some(other));
    }

    #[test]
    fn test_unbounded_timeout_on_free_lock() {
        let (lock, _map) = new_lock(1);
        assert!(lock.try_lock_for(Duration::MAX).unwrap());
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_unbounded_timeout_waits_until_cancelled() {
        let (lock, map) = new_lock(1);
        let lock = Arc::new(lock);
        let other = LockOwner::new(2, 77, false);
        update_holder(&map, "orders", |h| h.lock(other));

        let cancel = CancellationToken::new();
        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            thread::spawn(move || lock.try_lock_for_interruptibly(Duration::MAX, &cancel))
        };

        while !lock.has_queued_threads() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
        assert!(lock.pending_owners().is_empty());
        assert_eq!(lock.owner(), Some(other));
    }

    #[test]
    fn test_pre_cancelled_token_fails_fast() {
        let (lock, _map) = new_lock(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(lock.lock_interruptibly(&cancel), Err(Error::Interrupted)));
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (lock, _map) = new_lock(1);
        {
            let _guard = lock.guard().unwrap();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_display() {
        let (lock, map) = new_lock(1);
        assert_eq!(lock.to_string(), "DistributedLock{name=orders}[Unlocked]");
        update_holder(&map, "orders", |h| h.lock(LockOwner::new(2, 5, false)));
        assert_eq!(
            lock.to_string(),
            "DistributedLock{name=orders}[Locked by LockOwner{memberId=2, threadId=5, client=false}]"
        );
    }
}
