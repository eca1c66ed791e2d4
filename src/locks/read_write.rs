//! Server-side state of a read/write lock.

use crate::locks::owner::{LockOwner, OptionalOwner};
use crate::locks::LockHolder;
use crate::types::MemberId;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// A granted read lock and its reentrancy depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ReadHold {
    owner: LockOwner,
    count: u32,
}

/// Per-key state machine composing an exclusive write lock with shared read
/// locks.
///
/// Readers and the writer exclude each other, except that the write owner
/// may also take read locks (downgrade). Succession never grants a writer
/// while read locks remain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWriteLockHolder {
    write_owner: Option<LockOwner>,
    write_hold_count: u32,
    pending_write: VecDeque<LockOwner>,
    read_locks: Vec<ReadHold>,
    pending_read: VecDeque<LockOwner>,
}

impl ReadWriteLockHolder {
    /// Create an unlocked holder.
    pub fn new() -> Self {
        Self::default()
    }

    // ---- write lock ------------------------------------------------------

    /// Acquire the write lock, queueing `owner` when it cannot be granted.
    pub fn lock_write(&mut self, owner: LockOwner) -> bool {
        if self.can_grant_write(owner) {
            self.grant_write(owner);
            true
        } else {
            if !self.pending_write.contains(&owner) {
                self.pending_write.push_back(owner);
            }
            false
        }
    }

    /// Acquire the write lock only if it can be granted right away.
    pub fn try_lock_write(&mut self, owner: LockOwner) -> bool {
        if self.can_grant_write(owner) {
            self.grant_write(owner);
            true
        } else {
            false
        }
    }

    /// Release one write hold of `owner`.
    ///
    /// On the final release the next pending writer is granted if no read
    /// locks remain; otherwise every pending reader is granted together.
    pub fn unlock_write(&mut self, owner: LockOwner) -> bool {
        if !self.is_write_locked_by(owner) {
            return false;
        }
        self.write_hold_count -= 1;
        if self.write_hold_count == 0 {
            self.write_owner = None;
            self.promote();
        }
        true
    }

    /// Withdraw a queued write request.
    pub fn cancel_write(&mut self, owner: LockOwner) -> bool {
        let before = self.pending_write.len();
        self.pending_write.retain(|o| *o != owner);
        self.pending_write.len() != before
    }

    // ---- read lock -------------------------------------------------------

    /// Acquire a read lock, queueing `owner` if another owner holds the
    /// write lock.
    pub fn lock_read(&mut self, owner: LockOwner) -> bool {
        if self.can_grant_read(owner) {
            self.grant_read(owner);
            true
        } else {
            if !self.pending_read.contains(&owner) {
                self.pending_read.push_back(owner);
            }
            false
        }
    }

    /// Acquire a read lock only if it can be granted right away.
    pub fn try_lock_read(&mut self, owner: LockOwner) -> bool {
        if self.can_grant_read(owner) {
            self.grant_read(owner);
            true
        } else {
            false
        }
    }

    /// Release one read hold of `owner`.
    pub fn unlock_read(&mut self, owner: LockOwner) -> bool {
        let Some(pos) = self.read_locks.iter().position(|h| h.owner == owner) else {
            return false;
        };
        self.read_locks[pos].count -= 1;
        if self.read_locks[pos].count == 0 {
            self.read_locks.remove(pos);
            self.promote();
        }
        true
    }

    /// Withdraw a queued read request.
    pub fn cancel_read(&mut self, owner: LockOwner) -> bool {
        let before = self.pending_read.len();
        self.pending_read.retain(|o| *o != owner);
        self.pending_read.len() != before
    }

    // ---- queries ---------------------------------------------------------

    /// Whether the write lock is held.
    pub fn is_write_locked(&self) -> bool {
        self.write_owner.is_some()
    }

    /// Whether any read lock is held.
    pub fn is_read_locked(&self) -> bool {
        !self.read_locks.is_empty()
    }

    /// Whether either lock is held.
    pub fn is_locked(&self) -> bool {
        self.is_write_locked() || self.is_read_locked()
    }

    pub fn is_write_locked_by(&self, owner: LockOwner) -> bool {
        self.write_owner == Some(owner)
    }

    pub fn is_write_locked_by_member(&self, member_id: MemberId) -> bool {
        self.write_owner.is_some_and(|o| o.member_id() == member_id)
    }

    pub fn is_read_locked_by(&self, owner: LockOwner) -> bool {
        self.read_locks.iter().any(|h| h.owner == owner)
    }

    pub fn is_read_locked_by_member(&self, member_id: MemberId) -> bool {
        self.read_locks
            .iter()
            .any(|h| h.owner.member_id() == member_id)
    }

    /// The write lock owner.
    pub fn write_lock(&self) -> Option<LockOwner> {
        self.write_owner
    }

    pub fn write_hold_count(&self) -> u32 {
        self.write_hold_count
    }

    /// Read hold count of `owner`; zero if it holds no read lock.
    pub fn read_hold_count(&self, owner: LockOwner) -> u32 {
        self.read_locks
            .iter()
            .find(|h| h.owner == owner)
            .map_or(0, |h| h.count)
    }

    /// Number of owners holding a read lock.
    pub fn read_lock_count(&self) -> usize {
        self.read_locks.len()
    }

    /// Read lock owners in grant order.
    pub fn read_owners(&self) -> impl Iterator<Item = LockOwner> + '_ {
        self.read_locks.iter().map(|h| h.owner)
    }

    pub fn pending_write(&self) -> impl Iterator<Item = &LockOwner> + '_ {
        self.pending_write.iter()
    }

    pub fn pending_read(&self) -> impl Iterator<Item = &LockOwner> + '_ {
        self.pending_read.iter()
    }

    // ---- recovery --------------------------------------------------------

    /// Remove every trace of `member_id` and hand the lock on as an unlock
    /// would.
    pub fn remove_locks_for(&mut self, member_id: MemberId) -> bool {
        self.purge(|o| o.member_id() == member_id)
    }

    /// Remove every trace of members not in `member_ids`.
    pub fn retain_locks_for(&mut self, member_ids: &HashSet<MemberId>) -> bool {
        self.purge(|o| !member_ids.contains(&o.member_id()))
    }

    fn purge(&mut self, doomed: impl Fn(&LockOwner) -> bool) -> bool {
        let before = (
            self.pending_write.len(),
            self.pending_read.len(),
            self.read_locks.len(),
        );
        self.pending_write.retain(|o| !doomed(o));
        self.pending_read.retain(|o| !doomed(o));
        self.read_locks.retain(|h| !doomed(&h.owner));
        let mut changed = before
            != (
                self.pending_write.len(),
                self.pending_read.len(),
                self.read_locks.len(),
            );

        if self.write_owner.as_ref().is_some_and(&doomed) {
            self.write_owner = None;
            self.write_hold_count = 0;
            changed = true;
        }
        if changed {
            self.promote();
        }
        changed
    }

    // ---- helpers ---------------------------------------------------------

    fn can_grant_write(&self, owner: LockOwner) -> bool {
        self.read_locks.is_empty()
            && self.write_owner.map_or(true, |current| current == owner)
    }

    fn can_grant_read(&self, owner: LockOwner) -> bool {
        self.write_owner.map_or(true, |current| current == owner)
    }

    fn grant_write(&mut self, owner: LockOwner) {
        if self.write_owner.is_some() {
            self.write_hold_count += 1;
        } else {
            self.pending_write.retain(|o| *o != owner);
            self.write_owner = Some(owner);
            self.write_hold_count = 1;
        }
    }

    fn grant_read(&mut self, owner: LockOwner) {
        self.pending_read.retain(|o| *o != owner);
        match self.read_locks.iter_mut().find(|h| h.owner == owner) {
            Some(hold) => hold.count += 1,
            None => self.read_locks.push(ReadHold { owner, count: 1 }),
        }
    }

    /// Succession once the write lock is free.
    fn promote(&mut self) {
        if self.write_owner.is_some() {
            return;
        }
        if self.read_locks.is_empty() {
            if let Some(next) = self.pending_write.pop_front() {
                self.write_owner = Some(next);
                self.write_hold_count = 1;
                return;
            }
        }
        while let Some(reader) = self.pending_read.pop_front() {
            self.read_locks.push(ReadHold {
                owner: reader,
                count: 1,
            });
        }
    }
}

impl LockHolder for ReadWriteLockHolder {
    fn is_empty(&self) -> bool {
        !self.is_locked() && self.pending_write.is_empty() && self.pending_read.is_empty()
    }

    fn remove_locks_for(&mut self, member_id: MemberId) -> bool {
        ReadWriteLockHolder::remove_locks_for(self, member_id)
    }

    fn retain_locks_for(&mut self, member_ids: &HashSet<MemberId>) -> bool {
        ReadWriteLockHolder::retain_locks_for(self, member_ids)
    }
}

impl fmt::Display for ReadWriteLockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReadWriteLockHolder{{writeLocked={}, readLocked={}, writeLockOwner={}, readLocks=[",
            self.is_write_locked(),
            self.is_read_locked(),
            OptionalOwner(self.write_owner.as_ref())
        )?;
        for (i, hold) in self.read_locks.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(&hold.owner, f)?;
        }
        f.write_str("]}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(member: MemberId, thread: u64) -> LockOwner {
        LockOwner::new(member, thread, false)
    }

    #[test]
    fn test_reader_waits_for_writer_then_cohort_is_granted() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ReadWriteLockHolder::new();

        assert!(holder.lock_write(a));
        assert!(!holder.lock_read(b));
        assert!(!holder.lock_read(c));
        assert!(!holder.is_read_locked_by(b));

        assert!(holder.unlock_write(a));
        assert!(!holder.is_write_locked());
        assert!(holder.is_read_locked_by(b));
        assert!(holder.is_read_locked_by(c));
        assert_eq!(holder.pending_read().count(), 0);
    }

    #[test]
    fn test_pending_writer_goes_before_pending_readers() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_write(a);
        holder.lock_read(b);
        holder.lock_write(c);

        holder.unlock_write(a);
        assert!(holder.is_write_locked_by(c));
        assert!(!holder.is_read_locked());

        holder.unlock_write(c);
        assert!(holder.is_read_locked_by(b));
    }

    #[test]
    fn test_shared_readers_block_writer_until_all_release() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ReadWriteLockHolder::new();

        assert!(holder.lock_read(a));
        assert!(holder.lock_read(b));
        assert_eq!(holder.read_lock_count(), 2);
        assert!(!holder.lock_write(c));

        assert!(holder.unlock_read(a));
        assert!(!holder.is_write_locked());
        assert!(holder.unlock_read(b));
        assert!(holder.is_write_locked_by(c));
        assert_eq!(holder.write_hold_count(), 1);
        assert_eq!(holder.pending_write().count(), 0);
    }

    #[test]
    fn test_reentrant_read_and_write() {
        let a = owner(1, 1);
        let mut holder = ReadWriteLockHolder::new();

        assert!(holder.lock_read(a));
        assert!(holder.lock_read(a));
        assert_eq!(holder.read_hold_count(a), 2);
        assert!(holder.unlock_read(a));
        assert!(holder.unlock_read(a));
        assert!(!holder.unlock_read(a));

        assert!(holder.lock_write(a));
        assert!(holder.lock_write(a));
        assert_eq!(holder.write_hold_count(), 2);
        assert!(holder.unlock_write(a));
        assert!(holder.unlock_write(a));
        assert!(holder.is_empty());
    }

    #[test]
    fn test_writer_may_downgrade_to_read() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_write(a);
        assert!(holder.lock_read(a));
        holder.lock_write(b);

        // a still reads, so b must not be granted
        holder.unlock_write(a);
        assert!(!holder.is_write_locked());
        assert!(holder.is_read_locked_by(a));

        holder.unlock_read(a);
        assert!(holder.is_write_locked_by(b));
    }

    #[test]
    fn test_unlock_by_non_owner_is_rejected() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_write(a);
        let before = holder.clone();
        assert!(!holder.unlock_write(b));
        assert!(!holder.unlock_read(b));
        assert_eq!(holder, before);
    }

    #[test]
    fn test_try_lock_never_queues() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ReadWriteLockHolder::new();

        assert!(holder.try_lock_read(a));
        assert!(!holder.try_lock_write(b));
        assert_eq!(holder.pending_write().count(), 0);

        holder.unlock_read(a);
        assert!(holder.try_lock_write(b));
        assert!(!holder.try_lock_read(a));
        assert_eq!(holder.pending_read().count(), 0);
    }

    #[test]
    fn test_cancel_pending_requests() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_write(a);
        holder.lock_write(b);
        holder.lock_read(c);

        assert!(holder.cancel_write(b));
        assert!(holder.cancel_read(c));
        assert!(!holder.cancel_read(c));

        holder.unlock_write(a);
        assert!(holder.is_empty());
    }

    #[test]
    fn test_remove_locks_for_writer_promotes_readers() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_write(a);
        holder.lock_read(b);
        holder.lock_read(c);

        assert!(holder.is_write_locked_by_member(1));
        assert!(holder.remove_locks_for(1));
        assert!(holder.is_read_locked_by_member(2));
        assert!(holder.is_read_locked_by_member(3));
        assert!(!holder.remove_locks_for(1));
    }

    #[test]
    fn test_remove_locks_for_last_reader_promotes_writer() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_read(a);
        holder.lock_write(b);

        assert!(holder.remove_locks_for(1));
        assert!(holder.is_write_locked_by(b));
    }

    #[test]
    fn test_retain_locks_for_purges_all_roles() {
        let (a, b, c, d) = (owner(1, 1), owner(2, 1), owner(3, 1), owner(4, 1));
        let mut holder = ReadWriteLockHolder::new();

        holder.lock_read(a);
        holder.lock_read(b);
        holder.lock_write(c);
        holder.lock_write(d);

        assert!(holder.retain_locks_for(&HashSet::from([2, 4])));
        assert!(holder.is_read_locked_by(b));
        assert!(!holder.is_read_locked_by(a));
        assert_eq!(holder.pending_write().copied().collect::<Vec<_>>(), vec![d]);

        assert!(holder.retain_locks_for(&HashSet::from([4])));
        assert!(holder.is_write_locked_by(d));
        assert!(!holder.retain_locks_for(&HashSet::from([4])));
    }

    #[test]
    fn test_display() {
        let mut holder = ReadWriteLockHolder::new();
        assert_eq!(
            holder.to_string(),
            "ReadWriteLockHolder{writeLocked=false, readLocked=false, writeLockOwner=null, readLocks=[]}"
        );

        holder.lock_read(owner(1, 2));
        assert_eq!(
            holder.to_string(),
            "ReadWriteLockHolder{writeLocked=false, readLocked=true, writeLockOwner=null, \
             readLocks=[LockOwner{memberId=1, threadId=2, client=false}]}"
        );

        holder.lock_read(owner(2, 3));
        assert_eq!(
            holder.to_string(),
            "ReadWriteLockHolder{writeLocked=false, readLocked=true, writeLockOwner=null, \
             readLocks=[LockOwner{memberId=1, threadId=2, client=false}, \
             LockOwner{memberId=2, threadId=3, client=false}]}"
        );

        let mut writer = ReadWriteLockHolder::new();
        writer.lock_write(owner(5, 6));
        assert_eq!(
            writer.to_string(),
            "ReadWriteLockHolder{writeLocked=true, readLocked=false, \
             writeLockOwner=LockOwner{memberId=5, threadId=6, client=false}, readLocks=[]}"
        );
    }
}
