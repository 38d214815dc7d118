//! Group directory.

use courier_protocol::{Gid, Uid};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::debug;

/// Resolves a group id to its members.
pub trait GroupDirectory: Send + Sync {
    /// Find a group by id.
    fn find_group(&self, gid: Gid) -> Option<Arc<Group>>;
}

/// A chat group.
#[derive(Debug)]
pub struct Group {
    id: Gid,
    members: DashSet<Uid>,
}

impl Group {
    /// Create a group with an initial member set.
    #[must_use]
    pub fn new(id: Gid, members: impl IntoIterator<Item = Uid>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
        }
    }

    /// The group id.
    #[must_use]
    pub fn id(&self) -> Gid {
        self.id
    }

    /// Snapshot of the member uids, in no particular order.
    #[must_use]
    pub fn members(&self) -> Vec<Uid> {
        self.members.iter().map(|m| *m).collect()
    }

    /// Whether `uid` is a member.
    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.members.contains(&uid)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a member. Returns `false` if already present.
    pub fn add_member(&self, uid: Uid) -> bool {
        self.members.insert(uid)
    }

    /// Remove a member. Returns `false` if not present.
    pub fn remove_member(&self, uid: Uid) -> bool {
        self.members.remove(&uid).is_some()
    }
}

/// The in-process group directory.
#[derive(Debug, Default)]
pub struct GroupManager {
    groups: DashMap<Gid, Arc<Group>>,
}

impl GroupManager {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a group.
    pub fn create_group(&self, gid: Gid, members: impl IntoIterator<Item = Uid>) -> Arc<Group> {
        let group = Arc::new(Group::new(gid, members));
        debug!(gid, members = group.len(), "Group created");
        self.groups.insert(gid, Arc::clone(&group));
        group
    }

    /// Delete a group.
    pub fn remove_group(&self, gid: Gid) -> Option<Arc<Group>> {
        self.groups.remove(&gid).map(|(_, group)| group)
    }

    /// Add `uid` to group `gid`. Returns `false` if the group does not exist
    /// or `uid` is already a member.
    pub fn add_member(&self, gid: Gid, uid: Uid) -> bool {
        self.groups
            .get(&gid)
            .map(|g| g.add_member(uid))
            .unwrap_or(false)
    }

    /// Remove `uid` from group `gid`.
    pub fn remove_member(&self, gid: Gid, uid: Uid) -> bool {
        self.groups
            .get(&gid)
            .map(|g| g.remove_member(uid))
            .unwrap_or(false)
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl GroupDirectory for GroupManager {
    fn find_group(&self, gid: Gid) -> Option<Arc<Group>> {
        self.groups.get(&gid).map(|e| Arc::clone(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_members() {
        let manager = GroupManager::new();
        manager.create_group(10, [1, 2, 2, 3]);

        let group = manager.find_group(10).unwrap();
        let mut members = group.members();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3]);
        assert!(manager.find_group(11).is_none());
    }

    #[test]
    fn test_group_membership_changes() {
        let manager = GroupManager::new();
        manager.create_group(10, Vec::new());

        assert!(manager.add_member(10, 4));
        assert!(!manager.add_member(10, 4));
        assert!(!manager.add_member(99, 4));
        assert!(manager.find_group(10).unwrap().contains(4));

        assert!(manager.remove_member(10, 4));
        assert!(manager.find_group(10).unwrap().is_empty());

        assert!(manager.remove_group(10).is_some());
        assert!(manager.is_empty());
    }
}
