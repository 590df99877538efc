//! The replica: per-object replication state.
//!
//! A replica mirrors one game object. It carries the wire identity (id,
//! replica type, create context), the emplacement binding for objects that
//! pre-exist on every peer, the channel list, and the family-tree membership
//! used to ship spawned subtrees as one stream. Replicas live in the
//! replicator's arena; every cross-reference here is an id.

use quasar_bitstream::{BitStream, NetValueError};

use crate::channel::ReplicaChannel;
use crate::{CreateContext, EmplaceContext, FamilyTreeId, NetUserId, ReplicaId, ReplicaType};

/// Replication state for one object.
#[derive(Debug, Clone)]
pub struct Replica {
    /// Wire id; `ReplicaId(0)` until the replica goes live.
    id: ReplicaId,
    /// Archetype resource id transmitted so the receiver knows what to
    /// create.
    pub replica_type: ReplicaType,
    /// Space the object lives in (`0` for spaces themselves).
    pub create_context: CreateContext,
    /// Emplacement binding, for objects that pre-exist on every peer.
    pub emplace: Option<(EmplaceContext, u32)>,
    /// True when this replica was materialized from a remote stream rather
    /// than created locally.
    pub is_cloned: bool,
    /// Family-tree membership; `FamilyTreeId(0)` when alone.
    pub family_tree: FamilyTreeId,
    /// Declared parent, `ReplicaId(0)` when at the root of its space.
    pub parent: ReplicaId,
    /// Owning user, `NetUserId(0)` when unowned.
    pub owner_user: NetUserId,
    online: bool,
    channels: Vec<ReplicaChannel>,
}

impl Replica {
    pub fn new(replica_type: ReplicaType, create_context: CreateContext) -> Self {
        Self {
            id: ReplicaId(0),
            replica_type,
            create_context,
            emplace: None,
            is_cloned: false,
            family_tree: FamilyTreeId(0),
            parent: ReplicaId(0),
            owner_user: NetUserId(0),
            online: false,
            channels: Vec::new(),
        }
    }

    /// Wire id; 0 while offline.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ReplicaId) {
        self.id = id;
    }

    /// A replica is valid once it is live: online with a nonzero id.
    pub fn is_valid(&self) -> bool {
        self.online && self.id.0 != 0
    }

    /// True when the replica pre-existed locally and was bound by
    /// emplacement rather than created from a stream.
    pub fn is_emplaced(&self) -> bool {
        self.emplace.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    pub fn add_channel(&mut self, channel: ReplicaChannel) {
        self.channels.push(channel);
    }

    pub fn channels(&self) -> &[ReplicaChannel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [ReplicaChannel] {
        &mut self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&ReplicaChannel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut ReplicaChannel> {
        self.channels.iter_mut().find(|c| c.name == name)
    }

    /// Serializes every channel's current values (spawn/clone streams).
    /// Change-detection state is untouched.
    pub fn write_channels(&self, stream: &mut BitStream) {
        stream.write_u8(self.channels.len() as u8);
        for channel in &self.channels {
            channel.write_snapshot(stream);
        }
    }

    /// Deserializes channel data written by [`write_channels`]. The channel
    /// count is a layout self-check: both sides build channels from the same
    /// archetype, so a mismatch means the stream is desynchronized.
    ///
    /// [`write_channels`]: Replica::write_channels
    pub fn read_channels(
        &mut self,
        stream: &mut BitStream,
        now_ms: u64,
    ) -> Result<(), ReplicaStreamError> {
        let count = stream
            .read_u8()
            .map_err(|e| ReplicaStreamError::Value(NetValueError::Stream(e)))?;
        if count as usize != self.channels.len() {
            return Err(ReplicaStreamError::ChannelCountMismatch {
                wire: count as usize,
                local: self.channels.len(),
            });
        }
        for channel in &mut self.channels {
            channel.read_values(stream, now_ms)?;
        }
        Ok(())
    }

    /// Runs one convergence tick over every channel. Returns true while any
    /// property is still converging.
    pub fn converge_step(&mut self) -> bool {
        let mut moving = false;
        for channel in &mut self.channels {
            moving |= channel.converge_step();
        }
        moving
    }
}

/// Errors applying replica channel data from the wire.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaStreamError {
    /// The stream's channel count differs from the local layout.
    #[error("channel count mismatch: wire has {wire}, local layout has {local}")]
    ChannelCountMismatch { wire: usize, local: usize },

    /// A property value failed to deserialize.
    #[error(transparent)]
    Value(#[from] NetValueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::property::{PropertyConfig, ReplicaProperty};
    use quasar_bitstream::NetValue;

    fn replica_with_channel() -> Replica {
        let mut replica = Replica::new(ReplicaType(77), CreateContext(ReplicaId(0)));
        let mut channel = ReplicaChannel::new("State", ChannelConfig::default());
        channel.add_property(ReplicaProperty::new(
            "Health",
            NetValue::Integer(100),
            PropertyConfig::default(),
        ));
        replica.add_channel(channel);
        replica
    }

    #[test]
    fn test_offline_replica_is_invalid() {
        let replica = replica_with_channel();
        assert!(!replica.is_valid());
        assert_eq!(replica.id(), ReplicaId(0));
    }

    #[test]
    fn test_live_replica_is_valid() {
        let mut replica = replica_with_channel();
        replica.set_id(ReplicaId(4));
        replica.set_online(true);
        assert!(replica.is_valid());
    }

    #[test]
    fn test_channel_stream_roundtrip() {
        let mut sender = replica_with_channel();
        sender
            .channel_mut("State")
            .unwrap()
            .property_mut("Health")
            .unwrap()
            .set_value(NetValue::Integer(42), 10);

        let mut stream = BitStream::new();
        sender.write_channels(&mut stream);

        let mut receiver = replica_with_channel();
        receiver.read_channels(&mut stream, 20).unwrap();
        assert_eq!(
            receiver
                .channel("State")
                .unwrap()
                .property("Health")
                .unwrap()
                .value(),
            &NetValue::Integer(42)
        );
    }

    #[test]
    fn test_channel_count_mismatch_detected() {
        let mut sender = replica_with_channel();
        let mut stream = BitStream::new();
        sender.write_channels(&mut stream);

        let mut receiver = replica_with_channel();
        receiver.add_channel(ReplicaChannel::new("Extra", ChannelConfig::default()));
        assert!(matches!(
            receiver.read_channels(&mut stream, 0),
            Err(ReplicaStreamError::ChannelCountMismatch { wire: 1, local: 2 })
        ));
    }
}
