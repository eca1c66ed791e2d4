//! Per-member registry of lock handles.

use crate::config::LocksConfig;
use crate::error::Result;
use crate::locks::distributed::DistributedLock;
use crate::locks::remote_rw::RemoteReadWriteLock;
use crate::locks::service::LockService;
use crate::metrics::LockMetrics;
use crate::types::MemberId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Hands out lock handles for one member.
///
/// Handles are cached by name, so every caller on this member shares the
/// same local wait queue and hold counts for a given lock.
pub struct Locks {
    config: LocksConfig,
    service: Arc<LockService>,
    metrics: Arc<LockMetrics>,
    exclusive: DashMap<String, Arc<DistributedLock>>,
    read_write: DashMap<String, Arc<RemoteReadWriteLock>>,
}

impl Locks {
    /// Create a registry for `config.member_id` backed by `service`.
    pub fn new(config: LocksConfig, service: Arc<LockService>) -> Result<Self> {
        config.validate()?;
        let metrics = if config.metrics_enabled {
            LockMetrics::new()
        } else {
            LockMetrics::disabled()
        };
        info!(member_id = config.member_id, client = config.client, "Lock registry started");

        Ok(Self {
            config,
            service,
            metrics: Arc::new(metrics),
            exclusive: DashMap::new(),
            read_write: DashMap::new(),
        })
    }

    /// The exclusive lock called `name`.
    pub fn exclusive_lock(&self, name: &str) -> Arc<DistributedLock> {
        self.exclusive
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(DistributedLock::new(
                    name,
                    self.service.exclusive_map().clone(),
                    &self.config,
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// The read/write lock called `name`.
    pub fn read_write_lock(&self, name: &str) -> Arc<RemoteReadWriteLock> {
        self.read_write
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(RemoteReadWriteLock::new(
                    name,
                    self.service.read_write_map().clone(),
                    &self.config,
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    pub fn member_id(&self) -> MemberId {
        self.config.member_id
    }

    pub fn config(&self) -> &LocksConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<LockService> {
        &self.service
    }

    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for Locks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locks")
            .field("member_id", &self.config.member_id)
            .field("exclusive", &self.exclusive.len())
            .field("read_write", &self.read_write.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_handles_are_cached() {
        let locks = Locks::new(LocksConfig::new(1), Arc::new(LockService::new())).unwrap();
        let a = locks.exclusive_lock("a");
        assert!(Arc::ptr_eq(&a, &locks.exclusive_lock("a")));
        assert!(!Arc::ptr_eq(&a, &locks.exclusive_lock("b")));

        let rw = locks.read_write_lock("a");
        assert!(Arc::ptr_eq(&rw, &locks.read_write_lock("a")));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Locks::new(LocksConfig::new(0), Arc::new(LockService::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_disabled_metrics() {
        let config = LocksConfig::new(1).with_metrics_enabled(false);
        let locks = Locks::new(config, Arc::new(LockService::new())).unwrap();
        assert!(!locks.metrics().is_enabled());
    }
}
