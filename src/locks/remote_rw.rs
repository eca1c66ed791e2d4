//! Client-side handle for a cluster read/write lock.

use crate::config::LocksConfig;
use crate::error::{Error, Result};
use crate::locks::distributed::LocalHold;
use crate::locks::owner::{current_thread_id, LockOwner};
use crate::locks::read_write::ReadWriteLockHolder;
use crate::locks::waiter::{
    acquire_remote, deadline_after, AcquireContext, RemoteAcquire, WaitQueue,
};
use crate::locks::{update_holder, Lock};
use crate::metrics::LockMetrics;
use crate::store::{MapEvent, NamedMap};
use crate::types::MemberId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State shared by the read and write halves of one lock.
struct Shared {
    name: String,
    member_id: MemberId,
    client: bool,
    poll_interval: Duration,
    map: Arc<NamedMap<ReadWriteLockHolder>>,
    write_local: Mutex<LocalHold>,
    read_local: Mutex<HashMap<u64, u32>>,
    waiters: Arc<WaitQueue>,
    metrics: Arc<LockMetrics>,
}

impl Shared {
    fn current_owner(&self) -> LockOwner {
        LockOwner::current(self.member_id, self.client)
    }

    fn update<R>(&self, f: impl FnOnce(&mut ReadWriteLockHolder) -> R) -> R {
        update_holder(&self.map, &self.name, f)
    }

    fn holder(&self) -> Option<ReadWriteLockHolder> {
        self.map.get(&self.name)
    }

    fn context(&self) -> AcquireContext<'_> {
        AcquireContext {
            waiters: &self.waiters,
            metrics: &self.metrics,
            poll_interval: self.poll_interval,
        }
    }

    fn read_holds(&self, thread_id: u64) -> u32 {
        self.read_local.lock().get(&thread_id).copied().unwrap_or(0)
    }

    fn illegal_unlock(&self, owner: LockOwner, mode: &str) -> Error {
        self.metrics.record_illegal_unlock();
        warn!(lock = %self.name, %owner, mode, "Unlock by non-owner");
        Error::not_held(&self.name, owner)
    }
}

/// A reentrant read/write lock shared by every member of the cluster.
///
/// Any number of threads may hold the read lock while no thread holds the
/// write lock. The write owner may also take the read lock (downgrade);
/// the reverse upgrade is refused.
pub struct RemoteReadWriteLock {
    shared: Arc<Shared>,
    read: ReadLock,
    write: WriteLock,
}

impl RemoteReadWriteLock {
    pub(crate) fn new(
        name: &str,
        map: Arc<NamedMap<ReadWriteLockHolder>>,
        config: &LocksConfig,
        metrics: Arc<LockMetrics>,
    ) -> Self {
        let waiters = Arc::new(WaitQueue::new());
        let listener_waiters = waiters.clone();
        map.add_key_listener(
            name,
            Arc::new(move |event: &MapEvent<ReadWriteLockHolder>| {
                wake_grantees(&listener_waiters, event)
            }),
        );

        let shared = Arc::new(Shared {
            name: name.to_string(),
            member_id: config.member_id,
            client: config.client,
            poll_interval: config.poll_interval,
            map,
            write_local: Mutex::new(LocalHold::default()),
            read_local: Mutex::new(HashMap::new()),
            waiters,
            metrics,
        });

        Self {
            read: ReadLock { shared: shared.clone() },
            write: WriteLock { shared: shared.clone() },
            shared,
        }
    }

    /// Name of the lock.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The shared half.
    pub fn read_lock(&self) -> &ReadLock {
        &self.read
    }

    /// The exclusive half.
    pub fn write_lock(&self) -> &WriteLock {
        &self.write
    }

    /// Whether any thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        self.shared.holder().is_some_and(|h| h.is_write_locked())
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.shared.write_local.lock().is_held_by(current_thread_id())
    }

    /// Number of write holds of the calling thread.
    pub fn write_hold_count(&self) -> u32 {
        self.shared.write_local.lock().count_for(current_thread_id())
    }

    /// Number of read holds of the calling thread.
    pub fn read_hold_count(&self) -> u32 {
        self.shared.read_holds(current_thread_id())
    }

    /// Number of distinct owners holding the read lock, cluster-wide.
    pub fn read_lock_count(&self) -> usize {
        self.shared.holder().map_or(0, |h| h.read_lock_count())
    }

    /// Whether any thread holds the read lock.
    pub fn is_read_locked(&self) -> bool {
        self.shared.holder().is_some_and(|h| h.is_read_locked())
    }

    /// Current write owner, if any.
    pub fn owner(&self) -> Option<LockOwner> {
        self.shared.holder().and_then(|h| h.write_lock())
    }

    /// Current read owners.
    pub fn read_owners(&self) -> Vec<LockOwner> {
        self.shared
            .holder()
            .map(|h| h.read_owners().collect())
            .unwrap_or_default()
    }

    /// Whether any local thread is waiting for either half.
    pub fn has_queued_threads(&self) -> bool {
        !self.shared.waiters.is_empty()
    }

    /// Whether the local thread `thread_id` is waiting for either half.
    pub fn has_queued_thread(&self, thread_id: u64) -> bool {
        self.shared.waiters.contains_thread(thread_id)
    }

    /// Number of local threads waiting for either half.
    pub fn queue_length(&self) -> usize {
        self.shared.waiters.len()
    }

    /// Current holder state in the store.
    pub fn holder(&self) -> Option<ReadWriteLockHolder> {
        self.shared.holder()
    }
}

impl fmt::Display for RemoteReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let holder = self.shared.holder().unwrap_or_default();
        write!(
            f,
            "RemoteReadWriteLock{{name={}}}[Write locks = {}, Read locks = {}]",
            self.shared.name,
            holder.write_hold_count(),
            holder.read_lock_count()
        )
    }
}

impl fmt::Debug for RemoteReadWriteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReadWriteLock")
            .field("name", &self.shared.name)
            .field("member_id", &self.shared.member_id)
            .field("waiting", &self.shared.waiters.len())
            .finish()
    }
}

/// Shared half of a [`RemoteReadWriteLock`].
pub struct ReadLock {
    shared: Arc<Shared>,
}

impl ReadLock {
    fn acquire(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let owner = self.shared.current_owner();
        if self.reenter(owner.thread_id()) {
            return Ok(true);
        }
        let acquired = acquire_remote(self, &self.shared.context(), owner, deadline, cancel)?;
        if acquired {
            self.shared.read_local.lock().insert(owner.thread_id(), 1);
        }
        Ok(acquired)
    }

    fn reenter(&self, thread_id: u64) -> bool {
        match self.shared.read_local.lock().get_mut(&thread_id) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }
}

impl RemoteAcquire for ReadLock {
    fn lock_name(&self) -> &str {
        &self.shared.name
    }

    fn attempt(&self, owner: LockOwner) -> bool {
        self.shared.update(|h| h.lock_read(owner))
    }

    fn confirm(&self, owner: LockOwner) -> bool {
        self.shared
            .update(|h| h.is_read_locked_by(owner) || h.lock_read(owner))
    }

    fn abandon(&self, owner: LockOwner) -> bool {
        self.shared.update(|h| {
            if h.is_read_locked_by(owner) {
                true
            } else {
                h.cancel_read(owner);
                false
            }
        })
    }

    fn release(&self, owner: LockOwner) -> bool {
        self.shared.update(|h| h.unlock_read(owner))
    }
}

impl Lock for ReadLock {
    fn lock(&self) -> Result<()> {
        self.acquire(None, None).map(|_| ())
    }

    fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()> {
        self.acquire(None, Some(cancel)).map(|_| ())
    }

    fn try_lock(&self) -> Result<bool> {
        let owner = self.shared.current_owner();
        if self.reenter(owner.thread_id()) {
            return Ok(true);
        }
        if self.shared.update(|h| h.try_lock_read(owner)) {
            self.shared.read_local.lock().insert(owner.thread_id(), 1);
            self.shared.metrics.record_acquired(None);
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
        let owner = self.shared.current_owner();
        let last = {
            let mut holds = self.shared.read_local.lock();
            match holds.get_mut(&owner.thread_id()) {
                None => return Err(self.shared.illegal_unlock(owner, "read")),
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    holds.remove(&owner.thread_id());
                    true
                }
            }
        };
        if !last {
            return Ok(());
        }
        if self.release(owner) {
            self.shared.metrics.record_released();
            debug!(lock = %self.shared.name, %owner, "Read lock released");
            Ok(())
        } else {
            Err(self.shared.illegal_unlock(owner, "read"))
        }
    }
}

/// Exclusive half of a [`RemoteReadWriteLock`].
pub struct WriteLock {
    shared: Arc<Shared>,
}

impl WriteLock {
    fn acquire(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let owner = self.shared.current_owner();
        if self.shared.write_local.lock().reenter(owner.thread_id()) {
            return Ok(true);
        }
        if self.shared.read_holds(owner.thread_id()) > 0 {
            return Err(Error::UpgradeNotSupported(self.shared.name.clone()));
        }
        let acquired = acquire_remote(self, &self.shared.context(), owner, deadline, cancel)?;
        if acquired {
            self.shared.write_local.lock().grant(owner.thread_id());
        }
        Ok(acquired)
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.shared.write_local.lock().is_held_by(current_thread_id())
    }

    /// Number of write holds of the calling thread.
    pub fn hold_count(&self) -> u32 {
        self.shared.write_local.lock().count_for(current_thread_id())
    }
}

impl RemoteAcquire for WriteLock {
    fn lock_name(&self) -> &str {
        &self.shared.name
    }

    fn attempt(&self, owner: LockOwner) -> bool {
        self.shared.update(|h| h.lock_write(owner))
    }

    fn confirm(&self, owner: LockOwner) -> bool {
        self.shared
            .update(|h| h.is_write_locked_by(owner) || h.lock_write(owner))
    }

    fn abandon(&self, owner: LockOwner) -> bool {
        self.shared.update(|h| {
            if h.is_write_locked_by(owner) {
                true
            } else {
                h.cancel_write(owner);
                false
            }
        })
    }

    fn release(&self, owner: LockOwner) -> bool {
        self.shared.update(|h| h.unlock_write(owner))
    }
}

impl Lock for WriteLock {
    fn lock(&self) -> Result<()> {
        self.acquire(None, None).map(|_| ())
    }

    fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()> {
        self.acquire(None, Some(cancel)).map(|_| ())
    }

    fn try_lock(&self) -> Result<bool> {
        let owner = self.shared.current_owner();
        if self.shared.write_local.lock().reenter(owner.thread_id()) {
            return Ok(true);
        }
        if self.shared.read_holds(owner.thread_id()) > 0 {
            return Ok(false);
        }
        if self.shared.update(|h| h.try_lock_write(owner)) {
            self.shared.write_local.lock().grant(owner.thread_id());
            self.shared.metrics.record_acquired(None);
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
        let owner = self.shared.current_owner();
        let released = self.shared.write_local.lock().release(owner.thread_id());
        match released {
            Some(false) => Ok(()),
            Some(true) if self.release(owner) => {
                self.shared.metrics.record_released();
                debug!(lock = %self.shared.name, %owner, "Write lock released");
                Ok(())
            }
            _ => Err(self.shared.illegal_unlock(owner, "write")),
        }
    }
}

/// Wake every thread the holder now grants. Releasing a writer can admit a
/// whole cohort of readers at once, so all of them are signalled.
fn wake_grantees(waiters: &WaitQueue, event: &MapEvent<ReadWriteLockHolder>) {
    let Some(holder) = event.new_value.as_ref() else {
        waiters.signal_all();
        return;
    };
    if !holder.is_locked() {
        waiters.signal_all();
        return;
    }
    if let Some(writer) = holder.write_lock() {
        waiters.signal(&writer);
    }
    for reader in holder.read_owners() {
        waiters.signal(&reader);
    }
}
