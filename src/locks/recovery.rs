//! Releases locks held by members that leave the cluster.

use crate::cluster::{MemberEvent, MemberEventListener};
use crate::locks::service::LockService;
use crate::types::MemberId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Reacts to membership changes by purging lock state of departed members.
///
/// Can be registered directly as a [`MemberEventListener`] or driven from
/// the membership event channel with [`run_event_loop`](Self::run_event_loop).
/// Cleanup is idempotent, so doing both is harmless.
#[derive(Debug, Clone)]
pub struct LockRecovery {
    service: Arc<LockService>,
}

impl LockRecovery {
    pub fn new(service: Arc<LockService>) -> Self {
        Self { service }
    }

    /// Apply one membership event. Returns the number of holders changed.
    pub fn handle_event(&self, event: MemberEvent) -> usize {
        if !event.is_leave() {
            debug!(member_id = event.member_id(), "Ignoring membership event");
            return 0;
        }
        self.service.remove_locks_for(event.member_id())
    }

    /// Drop state of every member not in `live`, e.g. after a partition
    /// transfer or restore.
    pub fn reconcile(&self, live: &HashSet<MemberId>) -> usize {
        let changed = self.service.retain_locks_for(live);
        info!(live = live.len(), changed, "Reconciled lock owners");
        changed
    }

    /// Consume membership events until `shutdown_rx` fires or the event
    /// channel closes.
    pub async fn run_event_loop(
        self,
        mut events: mpsc::UnboundedReceiver<MemberEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Starting lock recovery event loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Lock recovery event loop shutting down");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Membership channel closed, stopping lock recovery");
                        break;
                    };
                    self.handle_event(event);
                }
            }
        }
    }
}

impl MemberEventListener for LockRecovery {
    fn on_event(&self, event: MemberEvent) {
        self.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterMembership;
    use crate::locks::{update_holder, LockOwner};
    use std::time::Duration;

    fn locked_service() -> Arc<LockService> {
        let service = Arc::new(LockService::new());
        update_holder(service.exclusive_map(), "a", |h| {
            h.lock(LockOwner::new(2, 1, false))
        });
        update_holder(service.exclusive_map(), "a", |h| {
            h.lock(LockOwner::new(3, 1, false))
        });
        service
    }

    #[test]
    fn test_listener_releases_failed_member() {
        let service = locked_service();
        let (membership, _rx) = ClusterMembership::new(1);
        membership.add_listener(Arc::new(LockRecovery::new(service.clone())));
        membership.handle_member_joined(2);
        membership.handle_member_joined(3);

        membership.handle_member_failed(2);
        let holder = service.exclusive_map().get("a").unwrap();
        assert_eq!(holder.owner(), Some(LockOwner::new(3, 1, false)));
    }

    #[test]
    fn test_join_events_are_ignored() {
        let service = locked_service();
        let recovery = LockRecovery::new(service);
        assert_eq!(recovery.handle_event(MemberEvent::Joined { member_id: 2 }), 0);
        assert_eq!(recovery.handle_event(MemberEvent::Left { member_id: 2 }), 1);
    }

    #[test]
    fn test_reconcile() {
        let service = locked_service();
        let recovery = LockRecovery::new(service.clone());
        assert_eq!(recovery.reconcile(&HashSet::from([1])), 1);
        assert!(service.exclusive_map().is_empty());
    }

    #[tokio::test]
    async fn test_event_loop_processes_channel() {
        let service = locked_service();
        let (membership, events) = ClusterMembership::new(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let recovery = LockRecovery::new(service.clone());
        let handle = tokio::spawn(recovery.run_event_loop(events, shutdown_rx));

        membership.handle_member_joined(2);
        membership.handle_member_left(2);

        let service_clone = service.clone();
        let released = crate::testing::wait_until(Duration::from_secs(5), move || {
            service_clone
                .exclusive_map()
                .get("a")
                .and_then(|h| h.owner())
                .is_some_and(|o| o.member_id() == 3)
        })
        .await;
        assert!(released);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
