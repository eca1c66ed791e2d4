//! Cluster-wide locks over a partitioned key-value grid.
//!
//! This crate provides reentrant exclusive locks and read/write locks whose
//! state lives in the grid, so any thread on any member can contend for them:
//! - **Holders** are small state machines stored one per lock name
//! - **Atomic entry processors** apply every state change under the key's lock
//! - **Change events** wake exactly the local threads that were granted
//! - **Membership recovery** releases locks of members that leave or fail
//!
//! # Example
//!
//! ```rust,no_run
//! use lockgrid::{Lock, LockService, Locks, LocksConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> lockgrid::Result<()> {
//!     let service = Arc::new(LockService::new());
//!     let locks = Locks::new(LocksConfig::new(1), service)?;
//!
//!     let lock = locks.exclusive_lock("orders");
//!     if lock.try_lock_for(Duration::from_secs(5))? {
//!         // critical section
//!         lock.unlock()?;
//!     }
//!
//!     let rw = locks.read_write_lock("catalog");
//!     let _guard = rw.read_lock().guard()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      DistributedLock / RemoteReadWriteLock   │
//! │  • lock / try_lock / try_lock_for / unlock  │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌──────────┐
//! │ Holders │   │ NamedMap │   │ Recovery │
//! │  (FSM)  │   │ + events │   │(members) │
//! └─────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Ownership
//!
//! A lock is owned by a thread of a member ([`LockOwner`]). Reentrant
//! acquisitions are counted on the member and only the first acquisition
//! and final release reach the grid.

pub mod cluster;
pub mod config;
pub mod console;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::LocksConfig;
pub use console::{Command, Console};
pub use error::{Error, Result};
pub use types::{MemberId, EXCLUSIVE_LOCKS_MAP, READ_WRITE_LOCKS_MAP};

// Re-export lock types
pub use locks::{
    current_thread_id, DistributedLock, ExclusiveLockHolder, Lock, LockGuard, LockHolder,
    LockOwner, LockRecovery, LockService, Locks, ReadLock, ReadWriteLockHolder,
    RemoteReadWriteLock, WriteLock,
};

// Re-export cluster types
pub use cluster::{ClusterMembership, LoggingEventListener, MemberEvent, MemberEventListener};

// Re-export store types
pub use store::{MapEvent, MapEventKind, MapListener, NamedMap, SnapshotError, SnapshotReader, SnapshotWriter};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, LockMetrics, LockMetricsSnapshot};

// Re-export testing types
pub use testing::{TestAssertions, TestGrid};
