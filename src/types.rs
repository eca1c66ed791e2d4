//! Core types used throughout the lock grid.

/// Cluster member identifier.
pub type MemberId = u64;

/// Name of the backing map holding exclusive lock state.
pub const EXCLUSIVE_LOCKS_MAP: &str = "exclusive-locks";

/// Name of the backing map holding read/write lock state.
pub const READ_WRITE_LOCKS_MAP: &str = "read-write-locks";
