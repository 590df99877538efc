//! Per-space replication state, including delayed attachment.
//!
//! During a game or level clone an object can arrive before its declared
//! parent exists locally. The space parks the child in a pair of mirrored
//! maps and attaches it the moment the parent comes online. Both maps hold
//! ids only and stay consistent under insert, fulfill, and removal.

use rustc_hash::{FxHashMap, FxHashSet};

use quasar_replication::ReplicaId;

use crate::engine::{CogId, LevelId};

/// Replication state for one net space.
#[derive(Debug)]
pub struct SpaceState {
    /// The space's replica id.
    pub replica: ReplicaId,
    /// The space cog.
    pub cog: CogId,
    /// Level currently loaded, if any.
    pub level: Option<LevelId>,
    /// Set while a level clone for this space is being applied.
    pub receiving_level_clone: bool,
    /// Fire `NetLevelStarted` on the next tick.
    pub level_started_pending: Option<LevelId>,

    /// ready child -> its not-yet-online parent.
    child_to_parent: FxHashMap<ReplicaId, ReplicaId>,
    /// not-yet-online parent -> its waiting children.
    parent_to_children: FxHashMap<ReplicaId, FxHashSet<ReplicaId>>,
}

impl SpaceState {
    pub fn new(replica: ReplicaId, cog: CogId) -> Self {
        Self {
            replica,
            cog,
            level: None,
            receiving_level_clone: false,
            level_started_pending: None,
            child_to_parent: FxHashMap::default(),
            parent_to_children: FxHashMap::default(),
        }
    }

    /// Parks `child` until `parent` comes online.
    pub fn defer_attachment(&mut self, child: ReplicaId, parent: ReplicaId) {
        self.child_to_parent.insert(child, parent);
        self.parent_to_children.entry(parent).or_default().insert(child);
    }

    /// A parent came online: returns every child waiting on it, clearing
    /// their entries from both maps.
    pub fn fulfill_attachments(&mut self, parent: ReplicaId) -> Vec<ReplicaId> {
        let Some(children) = self.parent_to_children.remove(&parent) else {
            return Vec::new();
        };
        let mut out: Vec<ReplicaId> = children.into_iter().collect();
        out.sort();
        for child in &out {
            self.child_to_parent.remove(child);
        }
        out
    }

    /// A waiting child was destroyed: drop its entry from both maps.
    pub fn remove_deferred_child(&mut self, child: ReplicaId) {
        if let Some(parent) = self.child_to_parent.remove(&child)
            && let Some(children) = self.parent_to_children.get_mut(&parent)
        {
            children.remove(&child);
            if children.is_empty() {
                self.parent_to_children.remove(&parent);
            }
        }
    }

    /// Clears the maps (game-clone completion).
    pub fn clear_deferred_attachments(&mut self) {
        self.child_to_parent.clear();
        self.parent_to_children.clear();
    }

    /// Count of children still waiting for a parent.
    pub fn deferred_count(&self) -> usize {
        self.child_to_parent.len()
    }

    /// Internal-consistency check: every child entry has a matching parent
    /// entry and vice versa.
    pub fn deferred_maps_consistent(&self) -> bool {
        let forward = self.child_to_parent.iter().all(|(child, parent)| {
            self.parent_to_children
                .get(parent)
                .is_some_and(|c| c.contains(child))
        });
        let backward = self.parent_to_children.iter().all(|(parent, children)| {
            !children.is_empty()
                && children
                    .iter()
                    .all(|child| self.child_to_parent.get(child) == Some(parent))
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SpaceState {
        SpaceState::new(ReplicaId(1), CogId(100))
    }

    #[test]
    fn test_fulfill_attaches_all_waiting_children() {
        let mut space = space();
        space.defer_attachment(ReplicaId(7), ReplicaId(5));
        space.defer_attachment(ReplicaId(8), ReplicaId(5));
        space.defer_attachment(ReplicaId(9), ReplicaId(6));
        assert!(space.deferred_maps_consistent());

        let children = space.fulfill_attachments(ReplicaId(5));
        assert_eq!(children, vec![ReplicaId(7), ReplicaId(8)]);
        assert_eq!(space.deferred_count(), 1, "child 9 still waits on 6");
        assert!(space.deferred_maps_consistent());
    }

    #[test]
    fn test_fulfill_unknown_parent_is_empty() {
        let mut space = space();
        assert!(space.fulfill_attachments(ReplicaId(42)).is_empty());
    }

    #[test]
    fn test_child_destruction_cleans_both_maps() {
        let mut space = space();
        space.defer_attachment(ReplicaId(7), ReplicaId(5));
        space.remove_deferred_child(ReplicaId(7));
        assert_eq!(space.deferred_count(), 0);
        assert!(space.deferred_maps_consistent());
        assert!(space.fulfill_attachments(ReplicaId(5)).is_empty());
    }

    #[test]
    fn test_clear_empties_everything() {
        let mut space = space();
        space.defer_attachment(ReplicaId(7), ReplicaId(5));
        space.defer_attachment(ReplicaId(9), ReplicaId(6));
        space.clear_deferred_attachments();
        assert_eq!(space.deferred_count(), 0);
        assert!(space.deferred_maps_consistent());
    }

    #[test]
    fn test_out_of_order_pair_resolves() {
        // Child 7 (parent 5) arrives before 5 exists; when 5 comes online
        // the child attaches and the maps drain.
        let mut space = space();
        space.defer_attachment(ReplicaId(7), ReplicaId(5));
        let attached = space.fulfill_attachments(ReplicaId(5));
        assert_eq!(attached, vec![ReplicaId(7)]);
        assert_eq!(space.deferred_count(), 0);
        assert!(space.deferred_maps_consistent());
    }
}
