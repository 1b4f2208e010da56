//! Buddy and group tables.
//!
//! Buddies are keyed by lowercased URI; the case the server used is preserved
//! on the entry itself for display. The account context owns both tables;
//! sessions and presence handlers refer to buddies by key only.

use super::types::canonical_key;
use std::collections::HashMap;

/// A server-side contact-list group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: i32,
    pub name: String,
}

/// Name used when the server list has no groups or a contact names none.
pub const OTHER_CONTACTS: &str = "Other Contacts";

#[derive(Debug, Default)]
pub struct GroupList {
    groups: Vec<Group>,
}

impl GroupList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, group: Group) {
        if self.find_by_id(group.id).is_none() {
            self.groups.push(group);
        }
    }

    pub fn find_by_id(&self, id: i32) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn rename(&mut self, id: i32, name: &str) {
        if let Some(g) = self.groups.iter_mut().find(|g| g.id == id) {
            g.name = name.to_string();
        }
    }

    pub fn remove(&mut self, id: i32) {
        self.groups.retain(|g| g.id != id);
    }

    pub fn first(&self) -> Option<&Group> {
        self.groups.first()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// A contact on the roaming list.
#[derive(Debug, Clone, Default)]
pub struct Buddy {
    /// URI as the server sent it, `sip:` prefixed.
    pub uri: String,
    pub display_name: Option<String>,
    /// Free-text note from presence.
    pub annotation: Option<String>,
    pub device_name: Option<String>,
    /// Sorted ids of the groups this buddy belongs to.
    pub group_ids: Vec<i32>,
    /// Set once a `state="resubscribe"` instance was seen for this contact;
    /// such contacts are excluded from later full batched subscriptions.
    pub resubscribed: bool,
}

impl Buddy {
    pub fn new(uri: &str) -> Self {
        Buddy {
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    pub fn add_group(&mut self, id: i32) {
        if let Err(pos) = self.group_ids.binary_search(&id) {
            self.group_ids.insert(pos, id);
        }
    }

    pub fn remove_group(&mut self, id: i32) {
        self.group_ids.retain(|g| *g != id);
    }

    /// Space-separated group id list for the `setContact` SOAP.
    pub fn groups_string(&self) -> String {
        self.group_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Case-insensitively keyed buddy table.
#[derive(Debug, Default)]
pub struct BuddyTable {
    map: HashMap<String, Buddy>,
}

impl BuddyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a buddy, returning a mutable handle; an existing entry under
    /// the same (case-folded) URI is reused.
    pub fn entry(&mut self, uri: &str) -> &mut Buddy {
        self.map
            .entry(canonical_key(uri))
            .or_insert_with(|| Buddy::new(uri))
    }

    pub fn get(&self, uri: &str) -> Option<&Buddy> {
        self.map.get(&canonical_key(uri))
    }

    pub fn get_mut(&mut self, uri: &str) -> Option<&mut Buddy> {
        self.map.get_mut(&canonical_key(uri))
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.map.contains_key(&canonical_key(uri))
    }

    pub fn remove(&mut self, uri: &str) -> Option<Buddy> {
        self.map.remove(&canonical_key(uri))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buddy> {
        self.map.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Buddy> {
        self.map.values_mut()
    }

    pub fn uris(&self) -> Vec<String> {
        self.map.values().map(|b| b.uri.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Drop every buddy whose key is not in `keep` (server reconciliation).
    /// Returns the URIs that were removed.
    pub fn retain_keys(&mut self, keep: &std::collections::HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        self.map.retain(|key, buddy| {
            if keep.contains(key) {
                true
            } else {
                removed.push(buddy.uri.clone());
                false
            }
        });
        removed
    }
}
