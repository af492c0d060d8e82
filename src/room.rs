use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::negotiation::ConnectionId;

/// What the negotiation engine must do after a membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipAction {
    Open { peer: ConnectionId, initiate: bool },
    Close(ConnectionId),
    CloseAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

/// Remote participants believed to be in the joined room, rebuilt purely
/// from join/leave notifications.
#[derive(Debug, Default)]
pub struct RoomMembership {
    local: Option<ConnectionId>,
    room: Option<String>,
    members: BTreeMap<ConnectionId, String>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// A new local id means every remote id we know about is dead.
    pub fn set_local_id(&mut self, id: ConnectionId) -> Option<MembershipAction> {
        let previous = self.local.replace(id.clone());
        match previous {
            Some(previous) if previous != id => {
                info!(old = %previous, new = %id, "local connection id changed");
                Some(self.reset())
            }
            _ => None,
        }
    }

    /// Starts tracking `room`. Switching rooms drops the old membership.
    pub fn enter(&mut self, room: &str) -> Option<MembershipAction> {
        if self.room.as_deref() == Some(room) {
            return None;
        }
        let previous = self.room.replace(room.to_string());
        if previous.is_some() && !self.members.is_empty() {
            return Some(self.reset());
        }
        None
    }

    pub fn leave(&mut self) -> MembershipAction {
        self.room = None;
        self.reset()
    }

    /// Forgets every member but keeps the room so it can be rejoined.
    pub fn reset(&mut self) -> MembershipAction {
        if !self.members.is_empty() {
            debug!(count = self.members.len(), "membership cleared");
        }
        self.members.clear();
        MembershipAction::CloseAll
    }

    pub fn on_joined(
        &mut self,
        connection_id: ConnectionId,
        display_name: String,
    ) -> Option<MembershipAction> {
        self.room.as_ref()?;
        let local = self.local.as_ref()?;
        if &connection_id == local || self.members.contains_key(&connection_id) {
            return None;
        }
        let initiate = local.outranks(&connection_id);
        info!(peer = %connection_id, name = %display_name, initiate, "participant joined");
        self.members.insert(connection_id.clone(), display_name);
        Some(MembershipAction::Open {
            peer: connection_id,
            initiate,
        })
    }

    pub fn on_left(&mut self, connection_id: &ConnectionId) -> Option<MembershipAction> {
        self.members.remove(connection_id)?;
        info!(peer = %connection_id, "participant left");
        Some(MembershipAction::Close(connection_id.clone()))
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.members
            .iter()
            .map(|(id, name)| Participant {
                connection_id: id.clone(),
                display_name: name.clone(),
            })
            .collect()
    }
}
