//! Configuration types for the lock grid.

use crate::error::{Error, Result};
use crate::types::MemberId;
use std::time::Duration;

/// Per-member configuration for a [`Locks`](crate::Locks) registry.
#[derive(Debug, Clone)]
pub struct LocksConfig {
    /// Identifier of the local cluster member.
    pub member_id: MemberId,

    /// Whether this member is a storage-disabled client.
    pub client: bool,

    /// Upper bound on how long a waiting thread sleeps before it retries
    /// the acquisition, even without a release notification.
    pub poll_interval: Duration,

    /// Whether lock metrics are recorded.
    pub metrics_enabled: bool,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            member_id: 1,
            client: false,
            poll_interval: Duration::from_millis(100),
            metrics_enabled: true,
        }
    }
}

impl LocksConfig {
    /// Create a new configuration for the given member.
    pub fn new(member_id: MemberId) -> Self {
        Self {
            member_id,
            ..Default::default()
        }
    }

    /// Mark this member as a client (storage-disabled) member.
    pub fn with_client(mut self, client: bool) -> Self {
        self.client = client;
        self
    }

    /// Set the retry poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable metrics.
    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Check the configuration for values the lock facades cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.member_id == 0 {
            return Err(Error::Config("member_id must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}
