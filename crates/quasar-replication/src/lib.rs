//! Replica data model and replicator: the arena of per-object replication
//! state, channels and properties, family trees, id stores, and the
//! spawn/clone stream codec.

use std::fmt;

use quasar_bitstream::{BitStream, BitStreamError, bits_for_value_count};

pub mod channel;
pub mod family;
pub mod idstore;
pub mod property;
pub mod replica;
pub mod replicator;

pub use channel::{
    AuthorityMode, ChannelConfig, DetectionMode, ReliabilityMode, ReplicaChannel,
};
pub use family::{FamilyTree, FamilyTrees};
pub use idstore::IdStore;
pub use property::{
    ConvergenceConfig, PropertyConfig, ReplicaProperty, default_value, values_equal,
};
pub use replica::{Replica, ReplicaStreamError};
pub use replicator::{
    ChangeFrame, Replicator, ReplicatorError, ReplicatorRole, SpawnMemberInfo, SpawnStreamHeader,
};

/// Wire id of a replicated object. 0 means offline / not yet live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    /// Highest id the wire encoding carries. Protocol fields holding a
    /// replica id quantize into `[0, MAX_WIRE]` rather than spending a full
    /// 32 bits.
    pub const MAX_WIRE: u32 = (1 << 20) - 1;

    /// Bits one quantized id occupies on the wire.
    pub fn wire_bits() -> u32 {
        bits_for_value_count(Self::MAX_WIRE as u64 + 1)
    }

    /// Writes the id quantized into the wire range. Returns bits written.
    pub fn write_quantized(self, stream: &mut BitStream) -> u32 {
        stream.write_quantized_i64(self.0 as i64, 0, Self::MAX_WIRE as i64, 1)
    }

    /// Reads an id written by [`write_quantized`].
    ///
    /// [`write_quantized`]: ReplicaId::write_quantized
    pub fn read_quantized(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        Ok(Self(
            stream.read_quantized_i64(0, Self::MAX_WIRE as i64, 1)? as u32,
        ))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a spawned subtree. 0 means no tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FamilyTreeId(pub u32);

impl fmt::Display for FamilyTreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local id of a peer on a link set. 0 is reserved for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetPeerId(pub u32);

impl fmt::Display for NetPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a logical participant. 0 means no user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetUserId(pub u32);

impl fmt::Display for NetUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag telling the receiver where to create a replica: the replica id of the
/// containing space, or 0 to create as a new space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateContext(pub ReplicaId);

/// Archetype resource id transmitted as the replica's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReplicaType(pub u64);

/// Emplacement context: the namespace within which emplace ids are assigned
/// deterministically on every peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmplaceContext(String);

impl EmplaceContext {
    /// Objects present in every participant because they came from the
    /// loaded game archetype.
    pub fn game_setup() -> Self {
        Self("GameSetup".to_string())
    }

    /// Objects belonging to a named level loaded into a specific net-space.
    pub fn space_level(space: ReplicaId, level_name: &str) -> Self {
        Self(format!("NetSpace_{}_Level_{}", space.0, level_name))
    }

    /// Rebuilds a context from its wire string.
    pub fn from_wire(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmplaceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emplace_context_strings() {
        assert_eq!(EmplaceContext::game_setup().as_str(), "GameSetup");
        assert_eq!(
            EmplaceContext::space_level(ReplicaId(4), "Arena").as_str(),
            "NetSpace_4_Level_Arena"
        );
    }

    #[test]
    fn test_replica_id_quantized_roundtrip() {
        assert_eq!(ReplicaId::wire_bits(), 20);

        let mut stream = BitStream::new();
        assert_eq!(
            ReplicaId(0).write_quantized(&mut stream),
            ReplicaId::wire_bits()
        );
        ReplicaId(7).write_quantized(&mut stream);
        ReplicaId(ReplicaId::MAX_WIRE).write_quantized(&mut stream);

        assert_eq!(ReplicaId::read_quantized(&mut stream).unwrap(), ReplicaId(0));
        assert_eq!(ReplicaId::read_quantized(&mut stream).unwrap(), ReplicaId(7));
        assert_eq!(
            ReplicaId::read_quantized(&mut stream).unwrap(),
            ReplicaId(ReplicaId::MAX_WIRE)
        );
        assert_eq!(stream.bits_unread(), 0);
    }
}
