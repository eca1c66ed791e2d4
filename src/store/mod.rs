//! Backing key-value store for lock state.
//!
//! Stands in for the partitioned grid: a [`NamedMap`] applies processors to
//! one key at a time under an exclusive lock and reports every committed
//! change to its listeners. Snapshots serialize holder maps for partition
//! transfer.

pub mod events;
pub mod map;
pub mod snapshot;

pub use events::{MapEvent, MapEventKind, MapListener};
pub use map::{InvocableEntry, NamedMap};
pub use snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};
