//! Cluster-wide locks.
//!
//! Lock state lives in the grid as one holder value per lock name. Every
//! state change is an atomic processor run against that entry, so the
//! holders need no synchronization of their own. Client-side facades turn
//! "queued" answers into blocking waits and wake up when the entry changes.
//!
//! ```text
//!   thread ──lock()──▶ DistributedLock ──invoke(name, lock(owner))──▶ NamedMap
//!      ▲                     │                                          │
//!      │                 WaitQueue ◀──── MapEvent (new holder) ─────────┘
//!      └──── signal(owner) ──┘
//! ```

pub mod distributed;
pub mod exclusive;
pub mod owner;
pub mod read_write;
pub mod recovery;
pub mod registry;
pub mod remote_rw;
pub mod service;
mod waiter;

pub use distributed::DistributedLock;
pub use exclusive::ExclusiveLockHolder;
pub use owner::{current_thread_id, LockOwner};
pub use read_write::ReadWriteLockHolder;
pub use recovery::LockRecovery;
pub use registry::Locks;
pub use remote_rw::{ReadLock, RemoteReadWriteLock, WriteLock};
pub use service::LockService;

use crate::error::Result;
use crate::store::NamedMap;
use crate::types::MemberId;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Common behaviour of the per-key lock state machines.
pub trait LockHolder:
    Clone + Default + PartialEq + std::fmt::Display + Send + Sync + 'static
{
    /// Whether the holder carries no state and can be dropped from the map.
    fn is_empty(&self) -> bool;

    /// Purge everything owned by `member_id`.
    fn remove_locks_for(&mut self, member_id: MemberId) -> bool;

    /// Purge everything owned by members outside `member_ids`.
    fn retain_locks_for(&mut self, member_ids: &HashSet<MemberId>) -> bool;
}

/// Run `f` against the holder stored under `key`, writing the result back
/// atomically. Holders that end up empty are removed from the map.
pub(crate) fn update_holder<H: LockHolder, R>(
    map: &NamedMap<H>,
    key: &str,
    f: impl FnOnce(&mut H) -> R,
) -> R {
    map.invoke(key, |entry| {
        let mut holder = entry.value_or_default();
        let result = f(&mut holder);
        if holder.is_empty() {
            entry.remove();
        } else {
            entry.set_value(holder);
        }
        result
    })
}

/// A blocking lock, in the shape of `java.util.concurrent.locks.Lock`.
///
/// Ownership is per thread: the thread that acquired the lock must be the
/// one that releases it.
pub trait Lock {
    /// Acquire the lock, waiting as long as necessary.
    fn lock(&self) -> Result<()>;

    /// Acquire the lock unless `cancel` fires first, in which case
    /// [`Error::Interrupted`](crate::Error::Interrupted) is returned and no
    /// queued request is left behind.
    fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()>;

    /// Acquire the lock only if it is free right now.
    fn try_lock(&self) -> Result<bool>;

    /// Acquire the lock, giving up after `timeout`.
    fn try_lock_for(&self, timeout: Duration) -> Result<bool>;

    /// Like [`try_lock_for`](Self::try_lock_for), but also gives up when
    /// `cancel` fires.
    fn try_lock_for_interruptibly(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Release one hold of the lock.
    fn unlock(&self) -> Result<()>;

    /// Acquire the lock and release it when the guard is dropped.
    fn guard(&self) -> Result<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        self.lock()?;
        Ok(LockGuard { lock: self })
    }
}

/// Releases a [`Lock`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, L: Lock> {
    lock: &'a L,
}

impl<L: Lock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!(error = %e, "Failed to release lock held by guard");
        }
    }
}
