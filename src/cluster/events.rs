//! Cluster membership events.

use crate::types::MemberId;

/// Events related to cluster membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// A member joined the cluster.
    Joined {
        /// The member's ID.
        member_id: MemberId,
    },

    /// A member left the cluster gracefully.
    Left {
        /// The member's ID.
        member_id: MemberId,
    },

    /// A member has been confirmed as failed.
    Failed {
        /// The member's ID.
        member_id: MemberId,
    },

    /// A previously failed member has come back.
    Recovered {
        /// The member's ID.
        member_id: MemberId,
    },
}

impl MemberEvent {
    /// Get the member ID associated with this event.
    pub fn member_id(&self) -> MemberId {
        match *self {
            MemberEvent::Joined { member_id }
            | MemberEvent::Left { member_id }
            | MemberEvent::Failed { member_id }
            | MemberEvent::Recovered { member_id } => member_id,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(
            self,
            MemberEvent::Joined { .. } | MemberEvent::Recovered { .. }
        )
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(self, MemberEvent::Left { .. } | MemberEvent::Failed { .. })
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::Joined { member_id } => {
                tracing::info!(member_id, "Member joined cluster");
            }
            MemberEvent::Left { member_id } => {
                tracing::info!(member_id, "Member left cluster");
            }
            MemberEvent::Failed { member_id } => {
                tracing::error!(member_id, "Member confirmed failed");
            }
            MemberEvent::Recovered { member_id } => {
                tracing::info!(member_id, "Member recovered");
            }
        }
    }
}
