//! Family trees: subtrees spawned together, shipped as one stream.
//!
//! When the authority spawns an object with children, the whole
//! ancestor+descendant set is registered under one tree id so a remote can
//! recreate the subtree from a single spawn stream. Members leave the tree
//! one by one as they are forgotten; the tree is erased when the last member
//! leaves.

use rustc_hash::FxHashMap;

use crate::idstore::IdStore;
use crate::{FamilyTreeId, ReplicaId};

/// One spawned subtree. Members are in depth-first pre-order with the
/// ancestor first.
#[derive(Debug, Clone)]
pub struct FamilyTree {
    pub id: FamilyTreeId,
    /// The spawn root. Stays set even after the ancestor itself is
    /// forgotten, so late clones still know the stream shape.
    pub ancestor: ReplicaId,
    members: Vec<ReplicaId>,
    /// Members not yet forgotten.
    present: Vec<bool>,
}

impl FamilyTree {
    /// All members, present or forgotten, in stream order.
    pub fn members(&self) -> &[ReplicaId] {
        &self.members
    }

    /// True when the member at `index` has not been forgotten.
    pub fn is_present(&self, index: usize) -> bool {
        self.present.get(index).copied().unwrap_or(false)
    }

    /// Members still present.
    pub fn present_members(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.members
            .iter()
            .zip(&self.present)
            .filter(|(_, p)| **p)
            .map(|(m, _)| *m)
    }

    /// Count of members still present.
    pub fn present_count(&self) -> usize {
        self.present.iter().filter(|p| **p).count()
    }
}

/// The tree registry.
#[derive(Debug, Default)]
pub struct FamilyTrees {
    trees: FxHashMap<FamilyTreeId, FamilyTree>,
    store: Option<IdStore>,
}

impl FamilyTrees {
    /// A registry that allocates its own tree ids (the authority).
    pub fn with_id_store() -> Self {
        Self {
            trees: FxHashMap::default(),
            store: Some(IdStore::new(1)),
        }
    }

    /// A registry fed ids from remote streams (clients).
    pub fn remote() -> Self {
        Self::default()
    }

    /// Registers a spawned subtree, allocating a tree id. `members` must be
    /// in depth-first pre-order with the ancestor first.
    pub fn create(&mut self, members: Vec<ReplicaId>) -> FamilyTreeId {
        debug_assert!(!members.is_empty());
        let id = FamilyTreeId(
            self.store
                .as_mut()
                .expect("only the authority allocates tree ids")
                .acquire(),
        );
        self.insert(id, members);
        id
    }

    /// Registers a subtree under an id received on the wire.
    pub fn insert(&mut self, id: FamilyTreeId, members: Vec<ReplicaId>) {
        let present = vec![true; members.len()];
        self.trees.insert(
            id,
            FamilyTree {
                id,
                ancestor: members[0],
                members,
                present,
            },
        );
    }

    pub fn get(&self, id: FamilyTreeId) -> Option<&FamilyTree> {
        self.trees.get(&id)
    }

    /// Marks a member forgotten. Erases the tree when no members remain;
    /// returns true when that happened.
    pub fn forget_member(&mut self, id: FamilyTreeId, member: ReplicaId) -> bool {
        let Some(tree) = self.trees.get_mut(&id) else {
            return false;
        };
        if let Some(index) = tree.members.iter().position(|m| *m == member) {
            tree.present[index] = false;
        }
        if tree.present_count() == 0 {
            self.trees.remove(&id);
            if let Some(store) = &mut self.store {
                store.release(id.0);
            }
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Drops every tree.
    pub fn clear(&mut self) {
        self.trees.clear();
        if let Some(store) = &mut self.store {
            store.reset();
        }
    }
}
