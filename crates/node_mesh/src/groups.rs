//! Group table: which remote peers belong to which groups.
//!
//! Both directions are indexed so `members_of` and `groups_of` are lookups.
//! Empty sets are dropped as soon as they become empty.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct GroupTable {
    members: HashMap<String, BTreeSet<String>>,
    groups: HashMap<String, BTreeSet<String>>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this membership was not tracked before.
    pub fn join(&mut self, peer: &str, group: &str) -> bool {
        let added = self
            .members
            .entry(group.to_string())
            .or_default()
            .insert(peer.to_string());
        if added {
            self.groups
                .entry(peer.to_string())
                .or_default()
                .insert(group.to_string());
        }
        added
    }

    /// Returns true if the peer was a member.
    pub fn leave(&mut self, peer: &str, group: &str) -> bool {
        let Some(members) = self.members.get_mut(group) else {
            return false;
        };
        if !members.remove(peer) {
            return false;
        }
        if members.is_empty() {
            self.members.remove(group);
        }
        if let Some(groups) = self.groups.get_mut(peer) {
            groups.remove(group);
            if groups.is_empty() {
                self.groups.remove(peer);
            }
        }
        true
    }

    /// Drop the peer from every group. Returns the groups it was in.
    pub fn leave_all(&mut self, peer: &str) -> Vec<String> {
        let groups = self.groups.remove(peer).unwrap_or_default();
        for group in &groups {
            if let Some(members) = self.members.get_mut(group) {
                members.remove(peer);
                if members.is_empty() {
                    self.members.remove(group);
                }
            }
        }
        groups.into_iter().collect()
    }

    pub fn members_of(&self, group: &str) -> Vec<String> {
        self.members
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn groups_of(&self, peer: &str) -> Vec<String> {
        self.groups
            .get(peer)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every group with at least one member, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.keys().cloned().collect();
        names.sort();
        names
    }
}
