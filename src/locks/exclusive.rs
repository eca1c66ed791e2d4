//! Server-side state of an exclusive lock.

use crate::locks::owner::{LockOwner, OptionalOwner};
use crate::locks::LockHolder;
use crate::types::MemberId;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Per-key state machine for an exclusive, reentrant lock.
///
/// Every method runs inside the backing map's atomic per-key update, so the
/// holder itself carries no synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusiveLockHolder {
    owner: Option<LockOwner>,
    hold_count: u32,
    pending: VecDeque<LockOwner>,
}

impl ExclusiveLockHolder {
    /// Create an unlocked holder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `owner`, queueing it if another owner holds it
    /// or earlier requests are still pending.
    ///
    /// Returns `true` if the lock was granted (or re-entered).
    pub fn lock(&mut self, owner: LockOwner) -> bool {
        match self.owner {
            None if self.is_next(owner) => {
                self.grant(owner);
                true
            }
            Some(current) if current == owner => {
                self.hold_count += 1;
                true
            }
            _ => {
                if !self.pending.contains(&owner) {
                    self.pending.push_back(owner);
                }
                false
            }
        }
    }

    /// Acquire the lock only if `owner` already holds it, or it is free and
    /// nobody is queued ahead of `owner`. Never queues.
    pub fn try_lock(&mut self, owner: LockOwner) -> bool {
        match self.owner {
            Some(current) => current == owner && self.lock(owner),
            None => self.is_next(owner) && self.lock(owner),
        }
    }

    /// Release one hold of `owner`.
    ///
    /// Returns `false` without changing anything if `owner` does not hold the
    /// lock. On the final release the head of the pending queue, if any,
    /// becomes the owner.
    pub fn unlock(&mut self, owner: LockOwner) -> bool {
        if !self.is_locked_by(owner) {
            return false;
        }
        self.hold_count -= 1;
        if self.hold_count == 0 {
            self.owner = None;
            self.promote();
        }
        true
    }

    /// Withdraw a queued request. Returns whether `owner` was pending.
    pub fn cancel(&mut self, owner: LockOwner) -> bool {
        let before = self.pending.len();
        self.pending.retain(|o| *o != owner);
        self.pending.len() != before
    }

    /// Whether any owner holds the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// Whether `owner` holds the lock.
    pub fn is_locked_by(&self, owner: LockOwner) -> bool {
        self.owner == Some(owner)
    }

    /// Whether a thread on `member_id` holds the lock.
    pub fn is_locked_by_member(&self, member_id: MemberId) -> bool {
        self.owner.is_some_and(|o| o.member_id() == member_id)
    }

    /// The current owner.
    pub fn owner(&self) -> Option<LockOwner> {
        self.owner
    }

    /// Reentrancy depth of the current owner; zero when unlocked.
    pub fn hold_count(&self) -> u32 {
        self.hold_count
    }

    /// Owners waiting for the lock, in arrival order.
    pub fn pending(&self) -> impl Iterator<Item = &LockOwner> + '_ {
        self.pending.iter()
    }

    /// Whether `owner` is waiting for the lock.
    pub fn is_pending(&self, owner: LockOwner) -> bool {
        self.pending.contains(&owner)
    }

    /// Remove every trace of `member_id`, releasing its hold if it owns the
    /// lock. Returns whether anything changed.
    pub fn remove_locks_for(&mut self, member_id: MemberId) -> bool {
        self.purge(|o| o.member_id() == member_id, true)
    }

    /// Remove every trace of members not in `member_ids`.
    ///
    /// A pruned hold leaves the lock free; the head of the queue takes it on
    /// its next attempt rather than being promoted here.
    pub fn retain_locks_for(&mut self, member_ids: &HashSet<MemberId>) -> bool {
        self.purge(|o| !member_ids.contains(&o.member_id()), false)
    }

    fn purge(&mut self, doomed: impl Fn(&LockOwner) -> bool, promote: bool) -> bool {
        let before = self.pending.len();
        self.pending.retain(|o| !doomed(o));
        let mut changed = self.pending.len() != before;

        if self.owner.as_ref().is_some_and(&doomed) {
            self.owner = None;
            self.hold_count = 0;
            if promote {
                self.promote();
            }
            changed = true;
        }
        changed
    }

    /// Whether a free lock may go to `owner` without passing a queued request.
    fn is_next(&self, owner: LockOwner) -> bool {
        self.pending.front().map_or(true, |head| *head == owner)
    }

    fn grant(&mut self, owner: LockOwner) {
        self.pending.retain(|o| *o != owner);
        self.owner = Some(owner);
        self.hold_count = 1;
    }

    fn promote(&mut self) {
        if let Some(next) = self.pending.pop_front() {
            self.owner = Some(next);
            self.hold_count = 1;
        }
    }
}

impl LockHolder for ExclusiveLockHolder {
    fn is_empty(&self) -> bool {
        self.owner.is_none() && self.pending.is_empty()
    }

    fn remove_locks_for(&mut self, member_id: MemberId) -> bool {
        ExclusiveLockHolder::remove_locks_for(self, member_id)
    }

    fn retain_locks_for(&mut self, member_ids: &HashSet<MemberId>) -> bool {
        ExclusiveLockHolder::retain_locks_for(self, member_ids)
    }
}

impl fmt::Display for ExclusiveLockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExclusiveLockHolder{{locked={}, owner={}}}",
            self.is_locked(),
            OptionalOwner(self.owner.as_ref())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(member: MemberId, thread: u64) -> LockOwner {
        LockOwner::new(member, thread, false)
    }

    #[test]
    fn test_second_owner_is_queued() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        assert!(holder.lock(a));
        assert!(!holder.lock(b));
        assert!(holder.is_locked_by(a));
        assert!(!holder.is_locked_by(b));
        assert!(holder.is_pending(b));

        // a repeated request does not duplicate the queue entry
        assert!(!holder.lock(b));
        assert_eq!(holder.pending().count(), 1);
    }

    #[test]
    fn test_reentrant_lock() {
        let a = owner(1, 1);
        let mut holder = ExclusiveLockHolder::new();

        assert!(holder.lock(a));
        assert!(holder.lock(a));
        assert!(holder.is_locked());
        assert_eq!(holder.hold_count(), 2);

        assert!(holder.unlock(a));
        assert!(holder.is_locked());
        assert!(holder.unlock(a));
        assert!(!holder.is_locked());
        assert_eq!(holder.hold_count(), 0);
        assert!(holder.is_empty());
    }

    #[test]
    fn test_unlock_hands_lock_to_first_pending() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a);
        holder.lock(b);
        holder.lock(c);

        assert!(holder.unlock(a));
        assert!(holder.is_locked_by(b));
        assert_eq!(holder.hold_count(), 1);

        // there is no free window for a newcomer to slip into
        let d = owner(4, 1);
        assert!(!holder.lock(d));
        assert_eq!(holder.pending().copied().collect::<Vec<_>>(), vec![c, d]);

        assert!(holder.unlock(b));
        assert!(holder.is_locked_by(c));
    }

    #[test]
    fn test_unlock_by_non_owner_is_rejected() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        assert!(!holder.unlock(a));

        holder.lock(a);
        holder.lock(b);
        let before = holder.clone();

        assert!(!holder.unlock(b));
        assert_eq!(holder, before);
    }

    #[test]
    fn test_try_lock_never_queues() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        assert!(holder.try_lock(a));
        assert!(!holder.try_lock(b));
        assert!(!holder.is_pending(b));
        assert!(holder.try_lock(a));
        assert_eq!(holder.hold_count(), 2);
    }

    #[test]
    fn test_cancel_removes_pending_request() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a);
        holder.lock(b);
        assert!(holder.cancel(b));
        assert!(!holder.cancel(b));

        holder.unlock(a);
        assert!(holder.is_empty());
    }

    #[test]
    fn test_lock_after_prune_removes_owner_from_pending() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a);
        holder.lock(b);
        holder.retain_locks_for(&HashSet::from([2]));

        assert!(holder.lock(b));
        assert!(holder.is_locked_by(b));
        assert!(!holder.is_pending(b));
    }

    #[test]
    fn test_free_lock_after_prune_goes_to_queue_head() {
        let (a, b, c) = (owner(1, 1), owner(2, 1), owner(3, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a);
        holder.lock(b);
        holder.retain_locks_for(&HashSet::from([2, 3]));
        assert!(!holder.is_locked());

        // a newcomer neither barges nor skips the queue
        assert!(!holder.try_lock(c));
        assert!(!holder.is_pending(c));
        assert!(!holder.lock(c));
        assert_eq!(holder.pending().copied().collect::<Vec<_>>(), vec![b, c]);
        assert!(!holder.is_locked());

        assert!(holder.lock(b));
        assert!(holder.is_locked_by(b));
        assert_eq!(holder.pending().copied().collect::<Vec<_>>(), vec![c]);

        assert!(holder.unlock(b));
        assert!(holder.is_locked_by(c));
    }

    #[test]
    fn test_remove_locks_for_promotes_next_owner() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a);
        holder.lock(b);

        assert!(holder.is_locked_by_member(1));
        assert!(holder.remove_locks_for(1));
        assert!(holder.is_locked_by(b));
        assert!(!holder.is_locked_by_member(1));

        assert!(!holder.remove_locks_for(1));
    }

    #[test]
    fn test_remove_locks_for_skips_other_threads_of_same_member() {
        let (a1, a2, b) = (owner(1, 1), owner(1, 2), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a1);
        holder.lock(a2);
        holder.lock(b);

        assert!(holder.remove_locks_for(1));
        assert!(holder.is_locked_by(b));
        assert_eq!(holder.pending().count(), 0);
    }

    #[test]
    fn test_retain_locks_for_prunes_without_granting() {
        let (a, b) = (owner(1, 1), owner(2, 1));
        let mut holder = ExclusiveLockHolder::new();

        holder.lock(a);
        holder.lock(b);

        assert!(holder.retain_locks_for(&HashSet::from([2])));
        assert!(!holder.is_locked());
        assert!(!holder.is_locked_by(b));
        assert!(holder.is_pending(b));

        assert!(!holder.retain_locks_for(&HashSet::from([2])));
    }

    #[test]
    fn test_display() {
        let mut holder = ExclusiveLockHolder::new();
        assert_eq!(
            holder.to_string(),
            "ExclusiveLockHolder{locked=false, owner=null}"
        );

        holder.lock(LockOwner::new(1, 5, false));
        assert_eq!(
            holder.to_string(),
            "ExclusiveLockHolder{locked=true, owner=LockOwner{memberId=1, threadId=5, client=false}}"
        );
    }
}
