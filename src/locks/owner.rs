//! Lock owner identity.

use crate::types::MemberId;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Numeric identifier of the calling thread.
///
/// Assigned on first use and stable for the lifetime of the thread. Unique
/// within the process, so together with a member id it identifies a thread
/// cluster-wide.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        let mut current = id.get();
        if current == 0 {
            current = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            id.set(current);
        }
        current
    })
}

/// Identifies a lock requester: a thread on a cluster member.
///
/// Equality and hashing ignore the client flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockOwner {
    member_id: MemberId,
    thread_id: u64,
    client: bool,
}

impl LockOwner {
    /// Create a new owner.
    pub fn new(member_id: MemberId, thread_id: u64, client: bool) -> Self {
        Self {
            member_id,
            thread_id,
            client,
        }
    }

    /// Owner for the calling thread on the given member.
    pub fn current(member_id: MemberId, client: bool) -> Self {
        Self::new(member_id, current_thread_id(), client)
    }

    /// The member this owner belongs to.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// The thread within the member.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Whether the owner is on a storage-disabled client member.
    pub fn is_client(&self) -> bool {
        self.client
    }
}

impl PartialEq for LockOwner {
    fn eq(&self, other: &Self) -> bool {
        self.member_id == other.member_id && self.thread_id == other.thread_id
    }
}

impl Eq for LockOwner {}

impl Hash for LockOwner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.member_id.hash(state);
        self.thread_id.hash(state);
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockOwner{{memberId={}, threadId={}, client={}}}",
            self.member_id, self.thread_id, self.client
        )
    }
}

/// Formats an optional owner the way the holders print it.
pub(crate) struct OptionalOwner<'a>(pub Option<&'a LockOwner>);

impl fmt::Display for OptionalOwner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(owner) => fmt::Display::fmt(owner, f),
            None => f.write_str("null"),
        }
    }
}
