//! Net users: logical participants and their owned-object sets.

use rustc_hash::{FxHashMap, FxHashSet};

use quasar_replication::{IdStore, NetPeerId, NetUserId, ReplicaId};

use crate::engine::CogId;
use crate::events::PayloadBundle;

/// One logical participant.
#[derive(Debug)]
pub struct NetUser {
    pub user_id: NetUserId,
    /// The NetUser cog.
    pub cog: CogId,
    /// The user's replica (users replicate like any other object).
    pub replica: ReplicaId,
    /// Peer that added the user.
    pub added_by: NetPeerId,
    /// Replica ids this user owns.
    owned: FxHashSet<ReplicaId>,
}

impl NetUser {
    pub fn new(user_id: NetUserId, cog: CogId, replica: ReplicaId, added_by: NetPeerId) -> Self {
        Self {
            user_id,
            cog,
            replica,
            added_by,
            owned: FxHashSet::default(),
        }
    }

    pub fn owns(&self, replica: ReplicaId) -> bool {
        self.owned.contains(&replica)
    }

    pub fn owned(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.owned.iter().copied()
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    pub(crate) fn add_owned(&mut self, replica: ReplicaId) {
        self.owned.insert(replica);
    }

    pub(crate) fn remove_owned(&mut self, replica: ReplicaId) {
        self.owned.remove(&replica);
    }

    pub(crate) fn take_owned(&mut self) -> Vec<ReplicaId> {
        let mut out: Vec<ReplicaId> = self.owned.drain().collect();
        out.sort();
        out
    }
}

/// The added-users tables: global and per-adding-peer, plus the user id
/// store.
#[derive(Debug)]
pub struct UserTables {
    users: FxHashMap<NetUserId, NetUser>,
    by_adder: FxHashMap<NetPeerId, Vec<NetUserId>>,
    id_store: IdStore,
}

impl Default for UserTables {
    fn default() -> Self {
        Self {
            users: FxHashMap::default(),
            by_adder: FxHashMap::default(),
            id_store: IdStore::new(1),
        }
    }
}

impl UserTables {
    /// Allocates the next user id (authority only).
    pub fn allocate_id(&mut self) -> NetUserId {
        NetUserId(self.id_store.acquire())
    }

    pub fn insert(&mut self, user: NetUser) {
        self.by_adder
            .entry(user.added_by)
            .or_default()
            .push(user.user_id);
        self.users.insert(user.user_id, user);
    }

    pub fn get(&self, id: NetUserId) -> Option<&NetUser> {
        self.users.get(&id)
    }

    pub fn get_mut(&mut self, id: NetUserId) -> Option<&mut NetUser> {
        self.users.get_mut(&id)
    }

    /// Removes a user, releasing its id for reissue when `release_id`.
    pub fn remove(&mut self, id: NetUserId, release_id: bool) -> Option<NetUser> {
        let user = self.users.remove(&id)?;
        if let Some(ids) = self.by_adder.get_mut(&user.added_by) {
            ids.retain(|u| *u != id);
        }
        if release_id {
            self.id_store.release(id.0);
        }
        Some(user)
    }

    /// Users added by one peer, in add order.
    pub fn added_by(&self, peer: NetPeerId) -> Vec<NetUserId> {
        self.by_adder.get(&peer).cloned().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetUser> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.by_adder.clear();
        self.id_store.reset();
    }
}

/// A locally-requested user add waiting for the server's answer.
#[derive(Debug, Clone)]
pub struct PendingUserAdd {
    pub request: PayloadBundle,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(tables: &mut UserTables, adder: NetPeerId) -> NetUserId {
        let id = tables.allocate_id();
        tables.insert(NetUser::new(id, CogId(1), ReplicaId(1), adder));
        id
    }

    #[test]
    fn test_tables_track_adder() {
        let mut tables = UserTables::default();
        let a = user(&mut tables, NetPeerId(0));
        let b = user(&mut tables, NetPeerId(3));
        let c = user(&mut tables, NetPeerId(3));

        assert_eq!(tables.added_by(NetPeerId(0)), vec![a]);
        assert_eq!(tables.added_by(NetPeerId(3)), vec![b, c]);
        assert_eq!(tables.len(), 3);
    }

    #[test]
    fn test_remove_releases_id_for_reissue() {
        let mut tables = UserTables::default();
        let a = user(&mut tables, NetPeerId(0));
        tables.remove(a, true);
        let b = tables.allocate_id();
        assert_eq!(a, b, "freed user id reissued");
    }

    #[test]
    fn test_owned_set() {
        let mut tables = UserTables::default();
        let id = user(&mut tables, NetPeerId(0));
        let u = tables.get_mut(id).unwrap();
        u.add_owned(ReplicaId(10));
        u.add_owned(ReplicaId(11));
        u.add_owned(ReplicaId(12));
        assert!(u.owns(ReplicaId(11)));
        u.remove_owned(ReplicaId(11));
        assert!(!u.owns(ReplicaId(11)));
        assert_eq!(u.take_owned(), vec![ReplicaId(10), ReplicaId(12)]);
        assert_eq!(u.owned_count(), 0);
    }
}
