//! Testing utilities for the lock grid.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           TestGrid                              │
//! │                                                                 │
//! │   Locks(1)    Locks(2)    Locks(3)   ...   one registry/member  │
//! │       └──────────┬───────────┘                                  │
//! │                  ▼                                              │
//! │            LockService  ◀── LockRecovery ◀── ClusterMembership  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every member shares one [`LockService`], so cross-member contention is
//! exercised with real threads in a single process. Failing a member through
//! the grid drives the same recovery path a membership service would.
//!
//! # Example
//!
//! ```rust,ignore
//! use lockgrid::testing::TestGrid;
//! use lockgrid::Lock;
//!
//! let grid = TestGrid::new(3);
//! let lock = grid.member(1).exclusive_lock("jobs");
//! lock.lock()?;
//! grid.fail_member(1);
//! ```

mod lock_scenarios;
mod utils;

pub use utils::wait_until;

use crate::cluster::ClusterMembership;
use crate::config::LocksConfig;
use crate::locks::{LockRecovery, LockService, Locks};
use crate::types::MemberId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval used by grid members; short so tests stay fast.
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Several members sharing one lock service.
pub struct TestGrid {
    /// Shared lock state.
    pub service: Arc<LockService>,

    /// Membership view, seeded with every grid member.
    pub membership: Arc<ClusterMembership>,

    members: Vec<Arc<Locks>>,

    /// When the test started.
    pub started_at: Instant,
}

impl TestGrid {
    /// Create a grid with members `1..=member_count`.
    pub fn new(member_count: usize) -> Self {
        Self::with_config(member_count, |config| config)
    }

    /// Create a grid, adjusting each member's configuration.
    pub fn with_config(member_count: usize, adjust: impl Fn(LocksConfig) -> LocksConfig) -> Self {
        let service = Arc::new(LockService::new());
        let (membership, _events) = ClusterMembership::new(1);
        membership.add_listener(Arc::new(LockRecovery::new(service.clone())));

        let members = (1..=member_count as MemberId)
            .map(|member_id| {
                membership.handle_member_joined(member_id);
                let config = adjust(LocksConfig::new(member_id).with_poll_interval(TEST_POLL_INTERVAL));
                match Locks::new(config, service.clone()) {
                    Ok(locks) => Arc::new(locks),
                    Err(e) => panic!("invalid test member config: {}", e),
                }
            })
            .collect();

        Self {
            service,
            membership,
            members,
            started_at: Instant::now(),
        }
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Registry of `member_id`. Panics for unknown members.
    pub fn member(&self, member_id: MemberId) -> &Arc<Locks> {
        &self.members[(member_id - 1) as usize]
    }

    /// All member IDs.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.iter().map(|m| m.member_id()).collect()
    }

    /// Report `member_id` as failed, releasing its locks.
    pub fn fail_member(&self, member_id: MemberId) {
        self.membership.handle_member_failed(member_id);
    }

    /// Get elapsed time since test started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Assertions for concurrent lock behaviour.
pub struct TestAssertions;

impl TestAssertions {
    /// Assert that a condition becomes true within timeout.
    pub fn assert_eventually<F>(check: F, timeout: Duration, message: &str)
    where
        F: Fn() -> bool,
    {
        if !Self::wait_for(check, timeout) {
            panic!("Assertion failed after {:?}: {}", timeout, message);
        }
    }

    /// Wait for a condition to become true within timeout.
    pub fn wait_for<F>(condition: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_members() {
        let grid = TestGrid::new(3);
        assert_eq!(grid.member_count(), 3);
        assert_eq!(grid.member_ids(), vec![1, 2, 3]);
        assert_eq!(grid.member(2).member_id(), 2);
        assert!(grid.membership.is_live(3));
    }

    #[test]
    fn test_wait_for() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag_clone.store(true, Ordering::Relaxed);
        });

        let result =
            TestAssertions::wait_for(|| flag.load(Ordering::Relaxed), Duration::from_secs(2));

        assert!(result);
    }
}
