//! The lock service: backing maps plus member cleanup and persistence.

use crate::error::Result;
use crate::locks::exclusive::ExclusiveLockHolder;
use crate::locks::read_write::ReadWriteLockHolder;
use crate::locks::{update_holder, LockHolder};
use crate::metrics::LockMetrics;
use crate::store::{NamedMap, SnapshotReader, SnapshotWriter};
use crate::types::{MemberId, EXCLUSIVE_LOCKS_MAP, READ_WRITE_LOCKS_MAP};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Owns the lock maps shared by every member.
#[derive(Debug)]
pub struct LockService {
    exclusive: Arc<NamedMap<ExclusiveLockHolder>>,
    read_write: Arc<NamedMap<ReadWriteLockHolder>>,
    metrics: Arc<LockMetrics>,
}

impl LockService {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(LockMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<LockMetrics>) -> Self {
        Self {
            exclusive: Arc::new(NamedMap::new(EXCLUSIVE_LOCKS_MAP)),
            read_write: Arc::new(NamedMap::new(READ_WRITE_LOCKS_MAP)),
            metrics,
        }
    }

    pub fn exclusive_map(&self) -> &Arc<NamedMap<ExclusiveLockHolder>> {
        &self.exclusive
    }

    pub fn read_write_map(&self) -> &Arc<NamedMap<ReadWriteLockHolder>> {
        &self.read_write
    }

    /// Cleanup metrics.
    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }

    /// Release every lock and queued request of a departed member, handing
    /// each lock on to its next waiter. Returns the number of holders that
    /// changed.
    pub fn remove_locks_for(&self, member_id: MemberId) -> usize {
        let changed = purge(&self.exclusive, |h| h.remove_locks_for(member_id))
            + purge(&self.read_write, |h| h.remove_locks_for(member_id));
        self.metrics.record_cleanup(changed);
        if changed > 0 {
            info!(member_id, changed, "Released locks of departed member");
        }
        changed
    }

    /// Drop every lock and queued request of members outside `members`.
    /// Returns the number of holders that changed.
    pub fn retain_locks_for(&self, members: &HashSet<MemberId>) -> usize {
        let changed = purge(&self.exclusive, |h| h.retain_locks_for(members))
            + purge(&self.read_write, |h| h.retain_locks_for(members));
        self.metrics.record_cleanup(changed);
        if changed > 0 {
            info!(live = members.len(), changed, "Dropped locks of unknown members");
        }
        changed
    }

    /// One line per holder, exclusive locks first, each sorted by name.
    pub fn dump(&self) -> Vec<String> {
        let exclusive = self
            .exclusive
            .entries()
            .into_iter()
            .map(|(name, holder)| format!("{}: {}", name, holder));
        let read_write = self
            .read_write
            .entries()
            .into_iter()
            .map(|(name, holder)| format!("{}: {}", name, holder));
        exclusive.chain(read_write).collect()
    }

    /// Serialize both maps.
    pub fn snapshot(&self) -> Result<Bytes> {
        let mut writer = SnapshotWriter::new();
        writer.write_section(&self.exclusive.entries())?;
        writer.write_section(&self.read_write.entries())?;
        let data = writer.finish();
        debug!(bytes = data.len(), "Lock snapshot written");
        Ok(data)
    }

    /// Load a snapshot produced by [`snapshot`](Self::snapshot), then drop
    /// state owned by members outside `live`. Returns the number of
    /// holders loaded.
    pub fn restore(&self, data: &[u8], live: &HashSet<MemberId>) -> Result<usize> {
        let mut reader = SnapshotReader::new(data)?;
        let exclusive: Vec<(String, ExclusiveLockHolder)> = reader.read_section()?;
        let read_write: Vec<(String, ReadWriteLockHolder)> = reader.read_section()?;
        let loaded = exclusive.len() + read_write.len();

        for (name, holder) in exclusive {
            self.exclusive.put(&name, holder);
        }
        for (name, holder) in read_write {
            self.read_write.put(&name, holder);
        }
        let pruned = self.retain_locks_for(live);
        info!(loaded, pruned, "Lock snapshot restored");
        Ok(loaded)
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

fn purge<H: LockHolder>(map: &NamedMap<H>, mut f: impl FnMut(&mut H) -> bool) -> usize {
    map.keys()
        .iter()
        .filter(|name| update_holder(map, name, |h| f(h)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockOwner;

    fn owner(member_id: MemberId, thread_id: u64) -> LockOwner {
        LockOwner::new(member_id, thread_id, false)
    }

    #[test]
    fn test_remove_locks_for_promotes_next_member() {
        let service = LockService::new();
        let (a, b) = (owner(1, 1), owner(2, 1));
        update_holder(service.exclusive_map(), "jobs", |h| h.lock(a));
        update_holder(service.exclusive_map(), "jobs", |h| h.lock(b));
        update_holder(service.read_write_map(), "conf", |h| h.lock_read(a));

        assert_eq!(service.remove_locks_for(1), 2);
        let jobs = service.exclusive_map().get("jobs").unwrap();
        assert!(jobs.is_locked_by(b));
        assert!(service.read_write_map().get("conf").is_none());
        assert_eq!(service.metrics().member_cleanups.get(), 2);

        assert_eq!(service.remove_locks_for(1), 0);
    }

    #[test]
    fn test_retain_locks_for_drops_unknown_members() {
        let service = LockService::new();
        update_holder(service.exclusive_map(), "a", |h| h.lock(owner(3, 1)));
        update_holder(service.exclusive_map(), "b", |h| h.lock(owner(1, 1)));

        let live = HashSet::from([1, 2]);
        assert_eq!(service.retain_locks_for(&live), 1);
        assert!(service.exclusive_map().get("a").is_none());
        assert!(service.exclusive_map().get("b").is_some());
    }

    #[test]
    fn test_dump_lists_all_holders() {
        let service = LockService::new();
        update_holder(service.exclusive_map(), "b", |h| h.lock(owner(1, 2)));
        update_holder(service.exclusive_map(), "a", |h| h.lock(owner(1, 1)));
        update_holder(service.read_write_map(), "c", |h| h.lock_write(owner(2, 1)));

        let dump = service.dump();
        assert_eq!(dump.len(), 3);
        assert!(dump[0].starts_with("a: ExclusiveLockHolder{locked=true"));
        assert!(dump[1].starts_with("b: "));
        assert!(dump[2].starts_with("c: ReadWriteLockHolder{writeLocked=true"));
    }

    #[test]
    fn test_snapshot_restore_prunes_dead_members() {
        let source = LockService::new();
        update_holder(source.exclusive_map(), "x", |h| h.lock(owner(1, 1)));
        update_holder(source.exclusive_map(), "y", |h| h.lock(owner(9, 1)));
        update_holder(source.read_write_map(), "z", |h| h.lock_read(owner(1, 4)));
        let data = source.snapshot().unwrap();

        let target = LockService::new();
        let loaded = target.restore(&data, &HashSet::from([1])).unwrap();
        assert_eq!(loaded, 3);
        assert!(target.exclusive_map().get("x").unwrap().is_locked_by(owner(1, 1)));
        assert!(target.exclusive_map().get("y").is_none());
        assert!(target
            .read_write_map()
            .get("z")
            .unwrap()
            .is_read_locked_by(owner(1, 4)));
    }

    #[test]
    fn test_restore_rejects_corrupt_data() {
        let service = LockService::new();
        let mut data = service.snapshot().unwrap().to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(service.restore(&data, &HashSet::new()).is_err());
    }
}
