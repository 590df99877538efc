//! Remote events, payload bundles, and the outbound event surface.
//!
//! A [`RemoteEvent`] is a named bag of typed properties that can be
//! serialized and delivered to an object on another peer. A
//! [`PayloadBundle`] is an ordered sequence of remote events written
//! back-to-back into one bitstream; every handshake payload (connect
//! request/response, user add/remove, disconnect notice, host info) is a
//! bundle.
//!
//! [`NetPeerEvent`] is the other direction: everything the subsystem reports
//! to the game through the main-thread dispatch bus.

use std::net::SocketAddr;

use quasar_bitstream::{BitStream, NetValue, NetValueError};
use quasar_net::DisconnectReason;
use quasar_replication::{NetPeerId, NetUserId, ReplicaId};

use crate::engine::{CogId, LevelId};
use crate::host::{Network, NetHost, RefreshResult};

/// Errors reading events off the wire.
#[derive(Debug, thiserror::Error)]
pub enum RemoteEventError {
    /// The serialized event's type name differs from the expected one.
    #[error("event type mismatch: expected {expected}, wire has {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The property kind tag was invalid.
    #[error("unknown event property kind {0}")]
    UnknownPropertyKind(u8),

    /// The stream ended early or held invalid values.
    #[error(transparent)]
    Value(#[from] NetValueError),

    /// The stream ended early.
    #[error(transparent)]
    Bits(#[from] quasar_bitstream::BitStreamError),
}

/// One property of a remote event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventProperty {
    /// A plain tagged value.
    Value(NetValue),
    /// A cog reference, shipped as its quantized replica id.
    Cog(ReplicaId),
    /// A cog path, shipped as its resolved string.
    CogPath(String),
    /// A `[NetPeerId]`-tagged slot: never serialized, filled on receipt
    /// with the sender's peer id.
    NetPeerId(NetPeerId),
}

impl EventProperty {
    fn kind(&self) -> u8 {
        match self {
            Self::Value(_) => 0,
            Self::Cog(_) => 1,
            Self::CogPath(_) => 2,
            Self::NetPeerId(_) => 3,
        }
    }
}

/// A typed event addressed to an object on another peer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteEvent {
    /// Registered event type name.
    pub type_name: String,
    /// Event id the receiver dispatches under.
    pub event_id: String,
    /// Named properties, in registration order.
    pub properties: Vec<(String, EventProperty)>,
}

impl RemoteEvent {
    pub fn new(type_name: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            event_id: event_id.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, property: EventProperty) -> Self {
        self.properties.push((name.into(), property));
        self
    }

    pub fn property(&self, name: &str) -> Option<&EventProperty> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    /// Serializes the event: type name, event id, then each property as
    /// `(name, kind, payload)`. `[NetPeerId]` slots write no payload.
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_string(&self.type_name);
        stream.write_string(&self.event_id);
        stream.write_u8(self.properties.len() as u8);
        for (name, property) in &self.properties {
            stream.write_string(name);
            stream.write_bits(property.kind() as u64, 2);
            match property {
                EventProperty::Value(value) => {
                    value.write_tagged(stream, None);
                }
                EventProperty::Cog(replica) => {
                    replica.write_quantized(stream);
                }
                EventProperty::CogPath(path) => {
                    stream.write_string(path);
                }
                EventProperty::NetPeerId(_) => {}
            }
        }
    }

    /// Deserializes an event, filling `[NetPeerId]` slots with
    /// `sender_peer_id`. When `expected_type` is given, a differing wire
    /// type is an error.
    pub fn read(
        stream: &mut BitStream,
        sender_peer_id: NetPeerId,
        expected_type: Option<&str>,
    ) -> Result<Self, RemoteEventError> {
        let type_name = stream.read_string()?;
        if let Some(expected) = expected_type
            && expected != type_name
        {
            return Err(RemoteEventError::TypeMismatch {
                expected: expected.to_string(),
                actual: type_name,
            });
        }
        let event_id = stream.read_string()?;
        let count = stream.read_u8()?;
        let mut properties = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = stream.read_string()?;
            let kind = stream.read_bits(2)? as u8;
            let property = match kind {
                0 => EventProperty::Value(NetValue::read_tagged(stream, None)?),
                1 => EventProperty::Cog(ReplicaId::read_quantized(stream)?),
                2 => EventProperty::CogPath(stream.read_string()?),
                3 => EventProperty::NetPeerId(sender_peer_id),
                other => return Err(RemoteEventError::UnknownPropertyKind(other)),
            };
            properties.push((name, property));
        }
        Ok(Self {
            type_name,
            event_id,
            properties,
        })
    }
}

/// An ordered sequence of remote events carried as one opaque payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadBundle {
    events: Vec<RemoteEvent>,
}

impl PayloadBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bundle holding a single event.
    pub fn with_event(event: RemoteEvent) -> Self {
        Self {
            events: vec![event],
        }
    }

    pub fn push(&mut self, event: RemoteEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[RemoteEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Serializes the bundle into a standalone stream.
    pub fn to_stream(&self) -> BitStream {
        let mut stream = BitStream::new();
        stream.write_varint(self.events.len() as u64);
        for event in &self.events {
            event.write(&mut stream);
        }
        stream
    }

    /// Deserializes a bundle, filling `[NetPeerId]` slots from the sender.
    pub fn from_stream(
        stream: &mut BitStream,
        sender_peer_id: NetPeerId,
    ) -> Result<Self, RemoteEventError> {
        let count = stream.read_varint()?;
        let mut events = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            events.push(RemoteEvent::read(stream, sender_peer_id, None)?);
        }
        Ok(Self { events })
    }
}

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// Everything the subsystem reports to the game, posted through
/// [`EventSink::dispatch`](crate::engine::EventSink::dispatch) on the main
/// thread.
#[derive(Debug, Clone)]
pub enum NetPeerEvent {
    // --- Peer lifecycle ---
    /// The peer opened and the game session went online.
    NetPeerOpened,
    /// The peer closed.
    NetPeerClosed,

    // --- Links ---
    /// Our connect attempt was answered.
    NetPeerConnectResponded {
        from: SocketAddr,
        accepted: bool,
        response: PayloadBundle,
    },
    /// A link reached Connected.
    NetLinkConnected { addr: SocketAddr, remote_guid: u64 },
    /// A link went down.
    NetLinkDisconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
        payload: PayloadBundle,
    },

    // --- Game lifecycle ---
    /// The networked game is running. Servers fire this at open; clients
    /// after the game clone completes.
    NetGameStarted,
    /// A game clone began arriving from the server.
    NetGameLoadStarted { from: SocketAddr },
    /// The game clone completed.
    NetGameLoadFinished { from: SocketAddr },
    /// A level finished its online transition in a space.
    NetLevelStarted { space: CogId, level: LevelId },

    // --- Object lifecycle ---
    /// A net object came online. Fired for every role; the role-specific
    /// variant follows.
    NetObjectOnline { object: CogId, replica: ReplicaId },
    NetGameOnline { object: CogId, replica: ReplicaId },
    NetSpaceOnline { object: CogId, replica: ReplicaId },
    NetUserOnline {
        object: CogId,
        replica: ReplicaId,
        user: NetUserId,
    },
    /// A net object is going offline. Role-specific variant precedes the
    /// flag clearing.
    NetObjectOffline { object: CogId, replica: ReplicaId },
    NetGameOffline { object: CogId, replica: ReplicaId },
    NetSpaceOffline { object: CogId, replica: ReplicaId },
    NetUserOffline {
        object: CogId,
        replica: ReplicaId,
        user: NetUserId,
    },

    // --- Users and ownership ---
    /// Answer to our add-user request.
    NetUserAddResponse {
        accepted: bool,
        user: NetUserId,
        user_object: Option<CogId>,
        response: PayloadBundle,
    },
    /// An object's owning user changed.
    NetUserOwnerChanged {
        object: CogId,
        replica: ReplicaId,
        previous: NetUserId,
        current: NetUserId,
    },
    /// A user lost ownership of an object.
    NetUserLostObjectOwnership {
        user: NetUserId,
        object: CogId,
        current_owner: NetUserId,
    },
    /// A user acquired ownership of an object.
    NetUserAcquiredObjectOwnership { user: NetUserId, object: CogId },

    // --- Remote events ---
    /// A remote event arrived for a local object.
    NetEventReceived {
        object: CogId,
        event: RemoteEvent,
        sender: NetPeerId,
    },

    // --- Host discovery ---
    /// A host answered for the first time in a request.
    NetHostDiscovered {
        network: Network,
        host: NetHost,
        refresh_result: RefreshResult,
    },
    /// A known host answered again.
    NetHostRefreshed {
        network: Network,
        host: NetHost,
        refresh_result: RefreshResult,
    },
    /// A multi-host discovery completed.
    NetHostListDiscovered {
        network: Network,
        hosts: Vec<NetHost>,
    },
    /// A multi-host refresh completed.
    NetHostListRefreshed {
        network: Network,
        hosts: Vec<NetHost>,
    },

    // --- Master server ---
    /// A publish created a new host record.
    NetHostRecordDiscovered { address: SocketAddr },
    /// A publish refreshed an existing host record.
    NetHostRecordUpdate { address: SocketAddr },
    /// A host record aged out.
    NetHostRecordExpired { address: SocketAddr },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> RemoteEvent {
        RemoteEvent::new("ChatMessage", "OnChatMessage")
            .with_property("Text", EventProperty::Value(NetValue::String("hi".into())))
            .with_property("Speaker", EventProperty::Cog(ReplicaId(12)))
            .with_property("SpeakerPath", EventProperty::CogPath("Game/Chat".into()))
            .with_property("FromPeer", EventProperty::NetPeerId(NetPeerId(0)))
    }

    #[test]
    fn test_event_roundtrip_fills_sender_peer_id() {
        let event = sample_event();
        let mut stream = BitStream::new();
        event.write(&mut stream);

        let back = RemoteEvent::read(&mut stream, NetPeerId(7), None).unwrap();
        assert_eq!(back.type_name, "ChatMessage");
        assert_eq!(back.event_id, "OnChatMessage");
        assert_eq!(
            back.property("Text"),
            Some(&EventProperty::Value(NetValue::String("hi".into())))
        );
        assert_eq!(back.property("Speaker"), Some(&EventProperty::Cog(ReplicaId(12))));
        // The [NetPeerId] slot carries the receiver-side sender id.
        assert_eq!(
            back.property("FromPeer"),
            Some(&EventProperty::NetPeerId(NetPeerId(7)))
        );
    }

    #[test]
    fn test_event_type_mismatch_rejected() {
        let event = sample_event();
        let mut stream = BitStream::new();
        event.write(&mut stream);

        let err = RemoteEvent::read(&mut stream, NetPeerId(1), Some("DamageEvent")).unwrap_err();
        assert!(matches!(err, RemoteEventError::TypeMismatch { .. }));
    }

    #[test]
    fn test_peer_id_slot_writes_no_payload() {
        let with_slot = RemoteEvent::new("E", "e")
            .with_property("P", EventProperty::NetPeerId(NetPeerId(9999)));
        let without = RemoteEvent::new("E", "e");

        let mut a = BitStream::new();
        with_slot.write(&mut a);
        let mut b = BitStream::new();
        without.write(&mut b);

        // Only the property name, count delta, and 2 kind bits separate them.
        let name_bits = BitStream::measure_string("P") as u64;
        assert_eq!(a.bits_written(), b.bits_written() + name_bits + 2);
    }

    #[test]
    fn test_bundle_roundtrip_preserves_order() {
        let mut bundle = PayloadBundle::new();
        bundle.push(RemoteEvent::new("First", "a"));
        bundle.push(sample_event());
        bundle.push(RemoteEvent::new("Last", "z"));

        let mut stream = bundle.to_stream();
        let back = PayloadBundle::from_stream(&mut stream, NetPeerId(3)).unwrap();
        let names: Vec<&str> = back.events().iter().map(|e| e.type_name.as_str()).collect();
        assert_eq!(names, vec!["First", "ChatMessage", "Last"]);
    }

    #[test]
    fn test_empty_bundle_is_tiny() {
        let bundle = PayloadBundle::new();
        let stream = bundle.to_stream();
        assert_eq!(stream.bits_written(), 8, "one varint byte");
        let mut stream = stream;
        assert!(
            PayloadBundle::from_stream(&mut stream, NetPeerId(0))
                .unwrap()
                .is_empty()
        );
    }
}
