//! The replicator: the arena of live replicas and the stream codec.
//!
//! The authority allocates replica ids and family trees and serializes
//! spawn/clone streams; clients materialize replicas from those streams and
//! bind emplaced objects to their server-assigned ids. Change detection runs
//! over the arena each tick and emits per-channel change frames.
//!
//! Spawn/clone stream layout:
//!
//! ```text
//! [flags: u8 (bit 0 = clone-from-spawn)]
//! [ancestor create context: u32] [ancestor replica type: u64]
//! [family tree id: u32 (0 = single object)]
//! [member count: u16]
//! per member, depth-first pre-order:
//!   [absent: 1 bit]                       -- absent members end here
//!   [replica id: u32] [is cloned: 1 bit] [parent id: u32]
//!   [emplaced: 1 bit] { [context: string] [emplace id: u32] }
//!   [channel count: u8] [channel values...]
//! ```

use rustc_hash::FxHashMap;

use quasar_bitstream::{BitStream, BitStreamError};

use crate::channel::ReliabilityMode;
use crate::family::FamilyTrees;
use crate::idstore::IdStore;
use crate::replica::{Replica, ReplicaStreamError};
use crate::{CreateContext, EmplaceContext, FamilyTreeId, ReplicaId, ReplicaType};

/// Which end of the replication relationship this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorRole {
    /// Allocates ids, emits spawns/clones/destroys. Servers and offline
    /// peers.
    Authority,
    /// Materializes remote streams.
    Client,
}

/// Replicator failures.
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    /// The operation requires the authority role.
    #[error("operation requires replication authority")]
    NotAuthority,

    /// No replica with this id is live.
    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),

    /// A stream tried to materialize an id that is already live.
    #[error("replica id {0} is already live")]
    DuplicateId(ReplicaId),

    /// A clone-from-emplacement named a context/id with no local
    /// counterpart.
    #[error("the emplace context appears mismatched: {context} #{emplace_id}")]
    EmplaceMismatch { context: String, emplace_id: u32 },

    /// A channel index in a change frame was out of range.
    #[error("channel index {index} out of range for replica {replica}")]
    BadChannelIndex { replica: ReplicaId, index: usize },

    /// Stream data failed to deserialize.
    #[error(transparent)]
    Stream(#[from] ReplicaStreamError),

    /// The stream ended early.
    #[error(transparent)]
    Bits(#[from] BitStreamError),
}

/// One emitted change frame: a channel's serialized values.
#[derive(Debug)]
pub struct ChangeFrame {
    pub replica: ReplicaId,
    pub channel_index: usize,
    pub reliability: ReliabilityMode,
    pub data: BitStream,
}

/// Parsed spawn/clone stream header.
#[derive(Debug, Clone)]
pub struct SpawnStreamHeader {
    pub clone_from_spawn: bool,
    pub create_context: CreateContext,
    pub replica_type: ReplicaType,
    pub family_tree: FamilyTreeId,
    pub member_count: u16,
}

/// Parsed identification of one present stream member.
#[derive(Debug, Clone)]
pub struct SpawnMemberInfo {
    pub id: ReplicaId,
    pub is_cloned: bool,
    pub parent: ReplicaId,
    pub emplace: Option<(EmplaceContext, u32)>,
}

/// The arena and codec.
pub struct Replicator {
    role: ReplicatorRole,
    replicas: FxHashMap<ReplicaId, Replica>,
    /// Live ids in creation order; `clear` drains in reverse.
    live_order: Vec<ReplicaId>,
    id_store: IdStore,
    trees: FamilyTrees,
    /// Client-side emplaced replicas waiting for their wire id, keyed by
    /// `(context, emplace id)`.
    pending_emplaced: FxHashMap<(String, u32), Replica>,
    /// Next emplace id per context, assigned in deterministic order.
    emplace_counters: FxHashMap<String, u32>,
}

impl Replicator {
    pub fn new(role: ReplicatorRole) -> Self {
        Self {
            role,
            replicas: FxHashMap::default(),
            live_order: Vec::new(),
            id_store: IdStore::new(1),
            trees: match role {
                ReplicatorRole::Authority => FamilyTrees::with_id_store(),
                ReplicatorRole::Client => FamilyTrees::remote(),
            },
            pending_emplaced: FxHashMap::default(),
            emplace_counters: FxHashMap::default(),
        }
    }

    pub fn role(&self) -> ReplicatorRole {
        self.role
    }

    pub fn is_authority(&self) -> bool {
        self.role == ReplicatorRole::Authority
    }

    // -----------------------------------------------------------------------
    // Arena
    // -----------------------------------------------------------------------

    pub fn get(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.get(&id)
    }

    pub fn get_mut(&mut self, id: ReplicaId) -> Option<&mut Replica> {
        self.replicas.get_mut(&id)
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.replicas.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Live ids in creation order.
    pub fn live_ids(&self) -> &[ReplicaId] {
        &self.live_order
    }

    /// Count of emplaced replicas still waiting for their wire id.
    pub fn pending_emplaced_count(&self) -> usize {
        self.pending_emplaced.len()
    }

    /// Ids of emplaced replicas that are live but not yet online.
    pub fn family_tree(&self, id: FamilyTreeId) -> Option<&crate::family::FamilyTree> {
        self.trees.get(id)
    }

    // -----------------------------------------------------------------------
    // Going live
    // -----------------------------------------------------------------------

    /// Authority: assigns a fresh id and inserts the replica into the arena.
    pub fn make_live(&mut self, mut replica: Replica) -> Result<ReplicaId, ReplicatorError> {
        if !self.is_authority() {
            return Err(ReplicatorError::NotAuthority);
        }
        let id = ReplicaId(self.id_store.acquire());
        replica.set_id(id);
        self.replicas.insert(id, replica);
        self.live_order.push(id);
        tracing::debug!(replica = %id, "replica live");
        Ok(id)
    }

    /// Client: inserts a replica materialized from a stream under its wire
    /// id.
    pub fn register_clone(
        &mut self,
        id: ReplicaId,
        mut replica: Replica,
    ) -> Result<(), ReplicatorError> {
        if self.replicas.contains_key(&id) {
            return Err(ReplicatorError::DuplicateId(id));
        }
        replica.set_id(id);
        replica.is_cloned = true;
        self.replicas.insert(id, replica);
        self.live_order.push(id);
        tracing::debug!(replica = %id, "replica materialized from stream");
        Ok(())
    }

    /// Declares a pre-existing local object a counterpart of a replica in
    /// `context`. Assigns the next emplace id within the context and returns
    /// it with the replica id. On the authority the replica goes live
    /// immediately; on a client it parks (id 0) until a
    /// clone-from-emplacement binds it.
    pub fn emplace(
        &mut self,
        mut replica: Replica,
        context: &EmplaceContext,
    ) -> Result<(ReplicaId, u32), ReplicatorError> {
        let counter = self
            .emplace_counters
            .entry(context.as_str().to_string())
            .or_insert(0);
        *counter += 1;
        let emplace_id = *counter;
        replica.emplace = Some((context.clone(), emplace_id));

        if self.is_authority() {
            Ok((self.make_live(replica)?, emplace_id))
        } else {
            self.pending_emplaced
                .insert((context.as_str().to_string(), emplace_id), replica);
            Ok((ReplicaId(0), emplace_id))
        }
    }

    /// Client: binds a parked emplaced replica to its server-assigned id.
    pub fn bind_emplaced(
        &mut self,
        context: &EmplaceContext,
        emplace_id: u32,
        wire_id: ReplicaId,
    ) -> Result<(), ReplicatorError> {
        let replica = self
            .pending_emplaced
            .remove(&(context.as_str().to_string(), emplace_id))
            .ok_or_else(|| ReplicatorError::EmplaceMismatch {
                context: context.as_str().to_string(),
                emplace_id,
            })?;
        if self.replicas.contains_key(&wire_id) {
            return Err(ReplicatorError::DuplicateId(wire_id));
        }
        let mut replica = replica;
        replica.set_id(wire_id);
        self.replicas.insert(wire_id, replica);
        self.live_order.push(wire_id);
        Ok(())
    }

    /// Drains emplaced replicas that never got bound (used when a level or
    /// game clone finishes and the stragglers must be destroyed).
    pub fn drain_pending_emplaced(&mut self, context_prefix: &str) -> Vec<Replica> {
        let keys: Vec<(String, u32)> = self
            .pending_emplaced
            .keys()
            .filter(|(ctx, _)| ctx.starts_with(context_prefix))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.pending_emplaced.remove(&k))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Online/offline and forgetting
    // -----------------------------------------------------------------------

    /// Flips the online flag on.
    pub fn mark_online(&mut self, id: ReplicaId) -> Result<(), ReplicatorError> {
        self.replicas
            .get_mut(&id)
            .map(|r| r.set_online(true))
            .ok_or(ReplicatorError::UnknownReplica(id))
    }

    /// Flips the online flag off and removes the replica from its family
    /// tree, erasing the tree when it empties.
    pub fn mark_offline(&mut self, id: ReplicaId) -> Result<(), ReplicatorError> {
        let replica = self
            .replicas
            .get_mut(&id)
            .ok_or(ReplicatorError::UnknownReplica(id))?;
        replica.set_online(false);
        let tree = replica.family_tree;
        if tree != FamilyTreeId(0) {
            self.trees.forget_member(tree, id);
        }
        Ok(())
    }

    /// Removes the replica from all local tracking without touching the
    /// game object. Returns the replica so the caller can finish tearing
    /// down its binding.
    pub fn forget(&mut self, id: ReplicaId) -> Option<Replica> {
        let replica = self.replicas.remove(&id)?;
        self.live_order.retain(|r| *r != id);
        if replica.family_tree != FamilyTreeId(0) {
            self.trees.forget_member(replica.family_tree, id);
        }
        if self.is_authority() {
            self.id_store.release(id.0);
        }
        tracing::debug!(replica = %id, "replica forgotten");
        Some(replica)
    }

    /// Forgets everything, in reverse creation order. Used on close.
    pub fn clear(&mut self) -> Vec<Replica> {
        let order: Vec<ReplicaId> = self.live_order.iter().rev().copied().collect();
        let mut out = Vec::with_capacity(order.len());
        for id in order {
            if let Some(replica) = self.forget(id) {
                out.push(replica);
            }
        }
        self.pending_emplaced.clear();
        self.emplace_counters.clear();
        self.trees.clear();
        self.id_store.reset();
        out
    }

    // -----------------------------------------------------------------------
    // Family trees
    // -----------------------------------------------------------------------

    /// Authority: registers `members` (depth-first pre-order, ancestor
    /// first) as one spawned subtree.
    pub fn create_family(
        &mut self,
        members: &[ReplicaId],
    ) -> Result<FamilyTreeId, ReplicatorError> {
        if !self.is_authority() {
            return Err(ReplicatorError::NotAuthority);
        }
        let tree = self.trees.create(members.to_vec());
        for &member in members {
            if let Some(replica) = self.replicas.get_mut(&member) {
                replica.family_tree = tree;
            }
        }
        Ok(tree)
    }

    /// Client: registers a subtree under the tree id from the wire.
    pub fn register_family(&mut self, tree: FamilyTreeId, members: &[ReplicaId]) {
        self.trees.insert(tree, members.to_vec());
        for &member in members {
            if let Some(replica) = self.replicas.get_mut(&member) {
                replica.family_tree = tree;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Spawn/clone streams
    // -----------------------------------------------------------------------

    /// Serializes the subtree rooted at `ancestor` (its whole family tree,
    /// or just itself when alone) into `stream`.
    pub fn write_spawn_stream(
        &self,
        ancestor: ReplicaId,
        clone_from_spawn: bool,
        stream: &mut BitStream,
    ) -> Result<(), ReplicatorError> {
        let root = self
            .replicas
            .get(&ancestor)
            .ok_or(ReplicatorError::UnknownReplica(ancestor))?;
        let tree_id = root.family_tree;
        let members: Vec<ReplicaId> = match self.trees.get(tree_id) {
            Some(tree) => tree.members().to_vec(),
            None => vec![ancestor],
        };

        stream.write_u8(clone_from_spawn as u8);
        stream.write_u32(root.create_context.0.0);
        stream.write_u64(root.replica_type.0);
        stream.write_u32(tree_id.0);
        stream.write_u16(members.len() as u16);

        for member in members {
            match self.replicas.get(&member) {
                None => {
                    // Forgotten mid-tree: one absent bit and nothing more.
                    stream.write_bool(true);
                }
                Some(replica) => {
                    stream.write_bool(false);
                    stream.write_u32(replica.id().0);
                    stream.write_bool(replica.is_cloned);
                    stream.write_u32(replica.parent.0);
                    match &replica.emplace {
                        Some((context, emplace_id)) => {
                            stream.write_bool(true);
                            stream.write_string(context.as_str());
                            stream.write_u32(*emplace_id);
                        }
                        None => {
                            stream.write_bool(false);
                        }
                    }
                    replica.write_channels(stream);
                }
            }
        }
        Ok(())
    }

    /// Reads the stream header written by [`write_spawn_stream`].
    ///
    /// [`write_spawn_stream`]: Replicator::write_spawn_stream
    pub fn read_spawn_header(stream: &mut BitStream) -> Result<SpawnStreamHeader, ReplicatorError> {
        Ok(SpawnStreamHeader {
            clone_from_spawn: stream.read_u8()? != 0,
            create_context: CreateContext(ReplicaId(stream.read_u32()?)),
            replica_type: ReplicaType(stream.read_u64()?),
            family_tree: FamilyTreeId(stream.read_u32()?),
            member_count: stream.read_u16()?,
        })
    }

    /// Reads one member's identification. `None` means the member was
    /// absent from the stream.
    pub fn read_member_info(
        stream: &mut BitStream,
    ) -> Result<Option<SpawnMemberInfo>, ReplicatorError> {
        if stream.read_bool()? {
            return Ok(None);
        }
        let id = ReplicaId(stream.read_u32()?);
        let is_cloned = stream.read_bool()?;
        let parent = ReplicaId(stream.read_u32()?);
        let emplace = if stream.read_bool()? {
            let context = EmplaceContext::from_wire(stream.read_string().map_err(
                |e| ReplicatorError::Stream(ReplicaStreamError::Value(e.into())),
            )?);
            let emplace_id = stream.read_u32()?;
            Some((context, emplace_id))
        } else {
            None
        };
        Ok(Some(SpawnMemberInfo {
            id,
            is_cloned,
            parent,
            emplace,
        }))
    }

    // -----------------------------------------------------------------------
    // Change detection
    // -----------------------------------------------------------------------

    /// Runs one change-detection tick over every online replica. The filter
    /// decides which channels this peer currently has authority over (fixed
    /// channels on the authority, dynamic ones wherever authority points).
    pub fn detect_changes(
        &mut self,
        mut has_authority: impl FnMut(&Replica, usize) -> bool,
    ) -> Vec<ChangeFrame> {
        let mut frames = Vec::new();
        for &id in &self.live_order {
            let Some(replica) = self.replicas.get_mut(&id) else {
                continue;
            };
            if !replica.is_online() {
                continue;
            }
            for index in 0..replica.channels().len() {
                if !has_authority(replica, index) {
                    continue;
                }
                let channel = &mut replica.channels_mut()[index];
                if !channel.detect() {
                    continue;
                }
                let reliability = channel.config.reliability;
                let mut data = BitStream::new();
                channel.write_values(&mut data);
                frames.push(ChangeFrame {
                    replica: id,
                    channel_index: index,
                    reliability,
                    data,
                });
            }
        }
        frames
    }

    /// Applies a received change frame.
    pub fn apply_change(
        &mut self,
        id: ReplicaId,
        channel_index: usize,
        data: &mut BitStream,
        now_ms: u64,
    ) -> Result<(), ReplicatorError> {
        let replica = self
            .replicas
            .get_mut(&id)
            .ok_or(ReplicatorError::UnknownReplica(id))?;
        let channel = replica.channels_mut().get_mut(channel_index).ok_or(
            ReplicatorError::BadChannelIndex {
                replica: id,
                index: channel_index,
            },
        )?;
        channel
            .read_values(data, now_ms)
            .map_err(|e| ReplicatorError::Stream(ReplicaStreamError::Value(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, DetectionMode, ReplicaChannel};
    use crate::property::{PropertyConfig, ReplicaProperty};
    use quasar_bitstream::NetValue;

    fn plain_replica() -> Replica {
        let mut replica = Replica::new(ReplicaType(5), CreateContext(ReplicaId(0)));
        let mut channel = ReplicaChannel::new(
            "State",
            ChannelConfig {
                detection_mode: DetectionMode::Automatic,
                ..Default::default()
            },
        );
        channel.add_property(ReplicaProperty::new(
            "Health",
            NetValue::Integer(100),
            PropertyConfig::default(),
        ));
        replica.add_channel(channel);
        replica
    }

    #[test]
    fn test_authority_ids_unique_and_reused_after_forget() {
        let mut replicator = Replicator::new(ReplicatorRole::Authority);
        let a = replicator.make_live(plain_replica()).unwrap();
        let b = replicator.make_live(plain_replica()).unwrap();
        assert_ne!(a, b);

        replicator.forget(a);
        let c = replicator.make_live(plain_replica()).unwrap();
        assert_eq!(c, a, "freed id reissued after the replica is gone");
        assert_ne!(c, b);
    }

    #[test]
    fn test_client_cannot_allocate() {
        let mut replicator = Replicator::new(ReplicatorRole::Client);
        assert!(matches!(
            replicator.make_live(plain_replica()),
            Err(ReplicatorError::NotAuthority)
        ));
    }

    #[test]
    fn test_emplace_binds_by_context_and_id() {
        let context = EmplaceContext::game_setup();

        let mut server = Replicator::new(ReplicatorRole::Authority);
        let (server_id, server_emplace_id) = server.emplace(plain_replica(), &context).unwrap();
        assert_ne!(server_id, ReplicaId(0));
        assert_eq!(server_emplace_id, 1);

        let mut client = Replicator::new(ReplicatorRole::Client);
        let (client_id, client_emplace_id) = client.emplace(plain_replica(), &context).unwrap();
        assert_eq!(client_id, ReplicaId(0));
        assert_eq!(client_emplace_id, server_emplace_id);
        assert_eq!(client.pending_emplaced_count(), 1);

        client.bind_emplaced(&context, 1, server_id).unwrap();
        assert_eq!(client.pending_emplaced_count(), 0);
        assert!(client.contains(server_id));
    }

    #[test]
    fn test_emplace_mismatch_reported() {
        let mut client = Replicator::new(ReplicatorRole::Client);
        let err = client
            .bind_emplaced(&EmplaceContext::game_setup(), 3, ReplicaId(9))
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::EmplaceMismatch { .. }));
    }

    #[test]
    fn test_spawn_stream_roundtrip() {
        let mut server = Replicator::new(ReplicatorRole::Authority);
        let root = server.make_live(plain_replica()).unwrap();
        let child_a = server.make_live(plain_replica()).unwrap();
        let child_b = server.make_live(plain_replica()).unwrap();
        server.get_mut(child_a).unwrap().parent = root;
        server.get_mut(child_b).unwrap().parent = root;
        let tree = server.create_family(&[root, child_a, child_b]).unwrap();

        server
            .get_mut(root)
            .unwrap()
            .channel_mut("State")
            .unwrap()
            .property_mut("Health")
            .unwrap()
            .set_value(NetValue::Integer(64), 10);

        let mut stream = BitStream::new();
        server.write_spawn_stream(root, false, &mut stream).unwrap();

        let header = Replicator::read_spawn_header(&mut stream).unwrap();
        assert!(!header.clone_from_spawn);
        assert_eq!(header.replica_type, ReplicaType(5));
        assert_eq!(header.family_tree, tree);
        assert_eq!(header.member_count, 3);

        let mut client = Replicator::new(ReplicatorRole::Client);
        let mut members = Vec::new();
        for _ in 0..header.member_count {
            let info = Replicator::read_member_info(&mut stream).unwrap().unwrap();
            let mut replica = plain_replica();
            replica.parent = info.parent;
            replica.read_channels(&mut stream, 0).unwrap();
            client.register_clone(info.id, replica).unwrap();
            members.push(info.id);
        }
        client.register_family(header.family_tree, &members);

        assert_eq!(client.len(), 3);
        assert_eq!(client.get(child_a).unwrap().parent, root);
        assert_eq!(
            client
                .get(root)
                .unwrap()
                .channel("State")
                .unwrap()
                .property("Health")
                .unwrap()
                .value(),
            &NetValue::Integer(64)
        );
        assert_eq!(client.get(root).unwrap().family_tree, tree);
    }

    #[test]
    fn test_absent_member_consumes_one_bit() {
        let mut server = Replicator::new(ReplicatorRole::Authority);
        let root = server.make_live(plain_replica()).unwrap();
        let child = server.make_live(plain_replica()).unwrap();
        server.create_family(&[root, child]).unwrap();
        // Forget the child; the stream keeps its slot as an absent bit.
        server.forget(child);

        let mut stream = BitStream::new();
        server.write_spawn_stream(root, true, &mut stream).unwrap();

        let header = Replicator::read_spawn_header(&mut stream).unwrap();
        assert_eq!(header.member_count, 2);
        assert!(Replicator::read_member_info(&mut stream).unwrap().is_some());
        assert!(Replicator::read_member_info(&mut stream).unwrap().is_none());
    }

    #[test]
    fn test_change_detection_emits_and_applies() {
        let mut server = Replicator::new(ReplicatorRole::Authority);
        let id = server.make_live(plain_replica()).unwrap();
        server.mark_online(id).unwrap();

        let mut client = Replicator::new(ReplicatorRole::Client);
        client.register_clone(id, plain_replica()).unwrap();
        client.mark_online(id).unwrap();

        // Nothing changed yet.
        assert!(server.detect_changes(|_, _| true).is_empty());

        server
            .get_mut(id)
            .unwrap()
            .channel_mut("State")
            .unwrap()
            .property_mut("Health")
            .unwrap()
            .set_value(NetValue::Integer(12), 5);
        let mut frames = server.detect_changes(|_, _| true);
        assert_eq!(frames.len(), 1);

        let frame = &mut frames[0];
        client
            .apply_change(frame.replica, frame.channel_index, &mut frame.data, 6)
            .unwrap();
        assert_eq!(
            client
                .get(id)
                .unwrap()
                .channel("State")
                .unwrap()
                .property("Health")
                .unwrap()
                .value(),
            &NetValue::Integer(12)
        );
    }

    #[test]
    fn test_offline_removes_from_tree() {
        let mut server = Replicator::new(ReplicatorRole::Authority);
        let a = server.make_live(plain_replica()).unwrap();
        let b = server.make_live(plain_replica()).unwrap();
        let tree = server.create_family(&[a, b]).unwrap();

        server.mark_offline(a).unwrap();
        assert_eq!(server.family_tree(tree).unwrap().present_count(), 1);
        server.mark_offline(b).unwrap();
        assert!(server.family_tree(tree).is_none());
    }

    #[test]
    fn test_clear_reverses_creation_order() {
        let mut server = Replicator::new(ReplicatorRole::Authority);
        let a = server.make_live(plain_replica()).unwrap();
        let b = server.make_live(plain_replica()).unwrap();
        let c = server.make_live(plain_replica()).unwrap();

        let drained = server.clear();
        let order: Vec<ReplicaId> = drained.iter().map(|r| r.id()).collect();
        assert_eq!(order, vec![c, b, a]);
        assert!(server.is_empty());
    }
}
