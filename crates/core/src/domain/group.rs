use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named authority tier. Higher `priority` means broader approval authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverGroup {
    pub id: GroupId,
    pub name: String,
    pub priority: i32,
    pub active: bool,
    pub members: BTreeSet<UserId>,
}

impl ApproverGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            id: GroupId(id.into()),
            name: name.into(),
            priority,
            active: true,
            members: BTreeSet::new(),
        }
    }

    pub fn with_member(mut self, user: impl Into<String>) -> Self {
        self.members.insert(UserId(user.into()));
        self
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

/// Orders groups for user-facing messages: highest priority first, then by name.
pub fn sort_by_priority_desc(groups: &mut [ApproverGroup]) {
    groups.sort_by(|left, right| {
        right.priority.cmp(&left.priority).then_with(|| left.name.cmp(&right.name))
    });
}

pub fn group_names(groups: &[ApproverGroup]) -> String {
    groups.iter().map(|group| group.name.as_str()).collect::<Vec<_>>().join(", ")
}
