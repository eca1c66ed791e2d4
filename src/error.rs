//! Error types for the lock grid.

use crate::store::SnapshotError;
use std::io;
use thiserror::Error;

/// Result type alias for lock grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the lock grid.
///
/// Holder state machines never produce these; they report through their
/// boolean return values and the facades translate those into errors.
#[derive(Error, Debug)]
pub enum Error {
    /// A lock was released by a thread that does not hold it.
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),

    /// A blocking acquisition was cancelled while waiting.
    #[error("interrupted while waiting for lock")]
    Interrupted,

    /// A thread holding the read lock asked for the write lock.
    #[error("read to write lock upgrade not supported: {0}")]
    UpgradeNotSupported(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Snapshot encoding or decoding failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Console command could not be parsed.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for an illegal monitor state error.
    pub(crate) fn not_held(name: &str, owner: impl std::fmt::Display) -> Self {
        Error::IllegalMonitorState(format!("lock '{}' is not held by {}", name, owner))
    }
}
