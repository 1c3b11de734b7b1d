//! Groups: named sets of member peers, plus the local node's own memberships.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::identity::PeerId;

/// A named group and the remote peers known to be in it.
#[derive(Debug, Clone, Default)]
pub struct Group {
    name: String,
    members: HashSet<PeerId>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. Returns `false` if it was already a member.
    pub fn join(&mut self, peer: PeerId) -> bool {
        self.members.insert(peer)
    }

    /// Remove a member. Returns `false` if it was not a member.
    pub fn leave(&mut self, peer: &PeerId) -> bool {
        self.members.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn members(&self) -> &HashSet<PeerId> {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Every group this node knows about.
///
/// Remote memberships and the local node's memberships live side by side: a
/// group exists while it has remote members or the local node is in it.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: HashMap<String, Group>,
    own: BTreeSet<String>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Names of all live groups, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Record that a remote peer joined `name`, creating the group lazily.
    /// Returns `false` when the peer was already a member.
    pub fn join_peer(&mut self, name: &str, peer: PeerId) -> bool {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
            .join(peer)
    }

    /// Record that a remote peer left `name`. Returns `false` when it was not
    /// a member.
    pub fn leave_peer(&mut self, name: &str, peer: &PeerId) -> bool {
        let Some(group) = self.groups.get_mut(name) else {
            return false;
        };
        let left = group.leave(peer);
        self.prune(name);
        left
    }

    /// Drop a peer from every group it belonged to, returning those groups.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<String> {
        let mut left: Vec<String> = self
            .groups
            .values_mut()
            .filter_map(|group| group.leave(peer).then(|| group.name.clone()))
            .collect();
        left.sort();
        for name in &left {
            self.prune(name);
        }
        left
    }

    /// Join `name` locally. Returns `false` if already joined.
    pub fn join_own(&mut self, name: &str) -> bool {
        if !self.own.insert(name.to_string()) {
            return false;
        }
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name));
        true
    }

    /// Leave `name` locally. Returns `false` if not joined.
    pub fn leave_own(&mut self, name: &str) -> bool {
        if !self.own.remove(name) {
            return false;
        }
        self.prune(name);
        true
    }

    pub fn is_own(&self, name: &str) -> bool {
        self.own.contains(name)
    }

    /// Groups the local node has joined, sorted.
    pub fn own_groups(&self) -> Vec<String> {
        self.own.iter().cloned().collect()
    }

    /// Remote members of `name`, empty when the group does not exist.
    pub fn members_of(&self, name: &str) -> Vec<PeerId> {
        self.groups
            .get(name)
            .map(|g| g.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Destroy the group when nobody, local or remote, is left in it.
    fn prune(&mut self, name: &str) {
        let empty = self.groups.get(name).is_some_and(Group::is_empty);
        if empty && !self.own.contains(name) {
            self.groups.remove(name);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
