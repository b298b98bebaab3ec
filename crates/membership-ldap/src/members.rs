//! Resolved membership of a directory group.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dn::DistinguishedName;

/// Members of a group, keyed by canonical member DN.
///
/// Each member maps to its display value, read from the resolver's configured uid
/// attribute. An empty map means the group exists and has no members; a group that
/// does not exist is never represented by this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembers {
    group: DistinguishedName,
    members: BTreeMap<String, String>,
    fetched_at: DateTime<Utc>,
}

impl GroupMembers {
    /// Creates a new builder for the given group.
    #[must_use]
    pub fn builder(group: DistinguishedName) -> GroupMembersBuilder {
        GroupMembersBuilder {
            group,
            members: BTreeMap::new(),
        }
    }

    /// Distinguished name of the group.
    #[must_use]
    pub const fn group(&self) -> &DistinguishedName {
        &self.group
    }

    /// When the membership was read from the directory.
    #[must_use]
    pub const fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Canonical member DNs in order.
    pub fn member_dns(&self) -> impl Iterator<Item = &str> + '_ {
        self.members.keys().map(String::as_str)
    }

    /// Iterates `(canonical member DN, display value)` pairs in DN order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.members
            .iter()
            .map(|(dn, uid)| (dn.as_str(), uid.as_str()))
    }

    /// Display value of a member.
    #[must_use]
    pub fn uid_of(&self, member: &DistinguishedName) -> Option<&str> {
        self.members.get(member.canonical()).map(String::as_str)
    }

    /// Checks whether the given distinguished name is a member of this group.
    #[must_use]
    pub fn has_member(&self, member: &DistinguishedName) -> bool {
        self.members.contains_key(member.canonical())
    }

    /// Finds a member by DN or by display value, ignoring case.
    ///
    /// Returns the canonical DN of the first match in DN order.
    #[must_use]
    pub fn find(&self, user: &str) -> Option<&str> {
        if let Ok(dn) = DistinguishedName::parse(user) {
            if let Some((member, _)) = self.members.get_key_value(dn.canonical()) {
                return Some(member.as_str());
            }
        }

        let wanted = user.trim().to_lowercase();
        self.members
            .iter()
            .find(|(_, uid)| uid.to_lowercase() == wanted)
            .map(|(member, _)| member.as_str())
    }
}

/// Builder for [`GroupMembers`].
#[derive(Debug)]
pub struct GroupMembersBuilder {
    group: DistinguishedName,
    members: BTreeMap<String, String>,
}

impl GroupMembersBuilder {
    /// Adds a member. A member added twice keeps its first display value.
    #[must_use]
    pub fn add_member(mut self, member: &DistinguishedName, uid: impl Into<String>) -> Self {
        self.members
            .entry(member.canonical().to_string())
            .or_insert_with(|| uid.into());
        self
    }

    /// Number of members collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if no member has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Builds the [`GroupMembers`], stamping the fetch time.
    #[must_use]
    pub fn build(self) -> GroupMembers {
        GroupMembers {
            group: self.group,
            members: self.members,
            fetched_at: Utc::now(),
        }
    }
}
