//! Cluster membership tracking.
//!
//! Keeps the set of live members and fans membership changes out to
//! registered listeners and to an event channel consumed by async tasks.

use crate::cluster::events::{MemberEvent, MemberEventListener};
use crate::types::MemberId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// State of a known member.
#[derive(Debug, Clone)]
struct MemberState {
    joined_at: Instant,
    is_alive: bool,
}

/// Cluster membership manager.
pub struct ClusterMembership {
    /// This member's ID.
    member_id: MemberId,

    /// Every member seen so far, alive or failed.
    members: RwLock<HashMap<MemberId, MemberState>>,

    /// Event listeners.
    listeners: RwLock<Vec<Arc<dyn MemberEventListener>>>,

    /// Channel for membership events.
    event_tx: mpsc::UnboundedSender<MemberEvent>,
}

impl ClusterMembership {
    /// Create a new membership manager with the local member already live.
    pub fn new(member_id: MemberId) -> (Arc<Self>, mpsc::UnboundedReceiver<MemberEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut members = HashMap::new();
        members.insert(
            member_id,
            MemberState {
                joined_at: Instant::now(),
                is_alive: true,
            },
        );

        let membership = Arc::new(Self {
            member_id,
            members: RwLock::new(members),
            listeners: RwLock::new(Vec::new()),
            event_tx,
        });

        (membership, event_rx)
    }

    /// Get this member's ID.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Add an event listener.
    pub fn add_listener(&self, listener: Arc<dyn MemberEventListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: MemberEvent) {
        // receiver may be gone; listeners still get the event
        let _ = self.event_tx.send(event);

        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    /// A member joined, or a failed member came back.
    pub fn handle_member_joined(&self, member_id: MemberId) {
        let mut members = self.members.write();
        let event = match members.get_mut(&member_id) {
            Some(state) if state.is_alive => {
                debug!(member_id, "Member already live");
                return;
            }
            Some(state) => {
                state.is_alive = true;
                MemberEvent::Recovered { member_id }
            }
            None => {
                members.insert(
                    member_id,
                    MemberState {
                        joined_at: Instant::now(),
                        is_alive: true,
                    },
                );
                MemberEvent::Joined { member_id }
            }
        };
        drop(members);

        info!(member_id, "Member joined");
        self.notify(event);
    }

    /// A member left gracefully.
    pub fn handle_member_left(&self, member_id: MemberId) {
        if self.members.write().remove(&member_id).is_none() {
            return;
        }
        info!(member_id, "Member left");
        self.notify(MemberEvent::Left { member_id });
    }

    /// A member was detected as failed.
    pub fn handle_member_failed(&self, member_id: MemberId) {
        let mut members = self.members.write();
        let Some(state) = members.get_mut(&member_id) else {
            return;
        };
        if !state.is_alive {
            return;
        }
        state.is_alive = false;
        drop(members);

        warn!(member_id, "Member failed");
        self.notify(MemberEvent::Failed { member_id });
    }

    /// IDs of the members currently alive.
    pub fn live_members(&self) -> HashSet<MemberId> {
        self.members
            .read()
            .iter()
            .filter(|(_, state)| state.is_alive)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether `member_id` is known and alive.
    pub fn is_live(&self, member_id: MemberId) -> bool {
        self.members
            .read()
            .get(&member_id)
            .is_some_and(|state| state.is_alive)
    }

    /// How long `member_id` has been a member.
    pub fn member_age(&self, member_id: MemberId) -> Option<std::time::Duration> {
        self.members
            .read()
            .get(&member_id)
            .map(|state| state.joined_at.elapsed())
    }
}

impl std::fmt::Debug for ClusterMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMembership")
            .field("member_id", &self.member_id)
            .field("members", &self.members.read().len())
            .finish()
    }
}
