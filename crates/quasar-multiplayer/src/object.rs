//! Net object role dispatch.
//!
//! NetPeer, NetSpace, and NetUser objects are all plain net objects with a
//! role variant on their binding; the role selects which online/offline
//! events fire around the generic ones.

use quasar_replication::{NetUserId, ReplicaId};

use crate::engine::CogId;
use crate::events::NetPeerEvent;

/// What kind of net object a replica is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetObjectRole {
    /// The game session itself.
    Peer,
    /// A space.
    Space,
    /// A user object.
    User(NetUserId),
    /// Any other replicated object.
    Plain,
}

/// How a replica property maps back onto reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyBindingKind {
    /// A plain basic-typed value.
    Plain,
    /// A cog reference, carried as a replica id.
    Cog,
    /// A cog path, carried as its resolved string.
    CogPath,
}

/// One replicated property's route between a channel slot and a component
/// field.
#[derive(Debug, Clone)]
pub struct PropertyBinding {
    pub channel: String,
    pub property: String,
    pub component: String,
    pub kind: PropertyBindingKind,
}

/// Binding between a replica and its cog.
#[derive(Debug, Clone)]
pub struct NetObjectBinding {
    pub cog: CogId,
    pub role: NetObjectRole,
    /// Routes for every reflected property the replica carries.
    pub properties: Vec<PropertyBinding>,
}

impl NetObjectRole {
    /// The role-specific event that follows the generic `NetObjectOnline`.
    pub fn online_event(self, object: CogId, replica: ReplicaId) -> NetPeerEvent {
        match self {
            Self::Peer => NetPeerEvent::NetGameOnline { object, replica },
            Self::Space => NetPeerEvent::NetSpaceOnline { object, replica },
            Self::User(user) => NetPeerEvent::NetUserOnline {
                object,
                replica,
                user,
            },
            Self::Plain => NetPeerEvent::NetObjectOnline { object, replica },
        }
    }

    /// The role-specific event that precedes the generic offline handling.
    pub fn offline_event(self, object: CogId, replica: ReplicaId) -> NetPeerEvent {
        match self {
            Self::Peer => NetPeerEvent::NetGameOffline { object, replica },
            Self::Space => NetPeerEvent::NetSpaceOffline { object, replica },
            Self::User(user) => NetPeerEvent::NetUserOffline {
                object,
                replica,
                user,
            },
            Self::Plain => NetPeerEvent::NetObjectOffline { object, replica },
        }
    }
}
