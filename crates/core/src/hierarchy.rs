use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::group::{ApproverGroup, GroupId, UserId};
use crate::domain::rule::Rule;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("approver group `{0}` does not exist")]
    UnknownGroup(GroupId),
    #[error("approver group id `{0}` already exists")]
    DuplicateGroupId(GroupId),
    #[error("approver group name `{0}` is already taken")]
    DuplicateGroupName(String),
    #[error("approver group `{group}` is still referenced by {rule_count} active rule(s)")]
    GroupInUse { group: GroupId, rule_count: usize },
}

/// Registry of approver groups and their memberships.
///
/// Inactive groups stay in the directory (rules may still reference them for
/// audit) but confer no authority.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDirectory {
    groups: BTreeMap<GroupId, ApproverGroup>,
}

impl GroupDirectory {
    pub fn new(groups: Vec<ApproverGroup>) -> Result<Self, DirectoryError> {
        let mut directory = Self::default();
        for group in groups {
            directory.create_group(group)?;
        }
        Ok(directory)
    }

    pub fn create_group(&mut self, group: ApproverGroup) -> Result<(), DirectoryError> {
        if self.groups.contains_key(&group.id) {
            return Err(DirectoryError::DuplicateGroupId(group.id));
        }
        let name_key = normalize_name(&group.name);
        if self.groups.values().any(|existing| normalize_name(&existing.name) == name_key) {
            return Err(DirectoryError::DuplicateGroupName(group.name));
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    pub fn get(&self, id: &GroupId) -> Option<&ApproverGroup> {
        self.groups.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ApproverGroup> {
        let key = normalize_name(name);
        self.groups.values().find(|group| normalize_name(&group.name) == key)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ApproverGroup> {
        self.groups.values()
    }

    pub fn add_member(&mut self, group: &GroupId, user: UserId) -> Result<bool, DirectoryError> {
        let group = self.group_mut(group)?;
        Ok(group.members.insert(user))
    }

    pub fn remove_member(&mut self, group: &GroupId, user: &UserId) -> Result<bool, DirectoryError> {
        let group = self.group_mut(group)?;
        Ok(group.members.remove(user))
    }

    /// Flags a group inactive. Refused while an active rule still targets it.
    pub fn deactivate(&mut self, group: &GroupId, rules: &[Rule]) -> Result<(), DirectoryError> {
        ensure_unreferenced(group, rules)?;
        self.group_mut(group)?.active = false;
        Ok(())
    }

    pub fn remove_group(
        &mut self,
        group: &GroupId,
        rules: &[Rule],
    ) -> Result<ApproverGroup, DirectoryError> {
        ensure_unreferenced(group, rules)?;
        self.groups.remove(group).ok_or_else(|| DirectoryError::UnknownGroup(group.clone()))
    }

    /// Whether `user` is a member of the active group `group`.
    pub fn is_member(&self, group: &GroupId, user: &UserId) -> bool {
        self.groups.get(group).is_some_and(|group| group.active && group.is_member(user))
    }

    pub fn groups_of<'a, 'u>(
        &'a self,
        user: &'u UserId,
    ) -> impl Iterator<Item = &'a ApproverGroup> + 'u
    where
        'a: 'u,
    {
        self.groups.values().filter(move |group| group.active && group.is_member(user))
    }

    /// The active group with the highest priority among `user`'s memberships.
    /// Ties break on group name so the answer is stable.
    pub fn highest_group(&self, user: &UserId) -> Option<&ApproverGroup> {
        self.groups_of(user).max_by(|left, right| {
            left.priority.cmp(&right.priority).then_with(|| right.name.cmp(&left.name))
        })
    }

    /// Hierarchy satisfaction: a user whose highest group ranks at least as
    /// high as `required` covers that requirement without holding it.
    pub fn satisfies(&self, required: &ApproverGroup, user: &UserId) -> bool {
        if self.is_member(&required.id, user) {
            return true;
        }
        self.highest_group(user).is_some_and(|highest| highest.priority >= required.priority)
    }

    fn group_mut(&mut self, group: &GroupId) -> Result<&mut ApproverGroup, DirectoryError> {
        self.groups.get_mut(group).ok_or_else(|| DirectoryError::UnknownGroup(group.clone()))
    }
}

/// Resolves whether an approver reference still points at a usable account.
pub trait ApproverResolver {
    fn is_active(&self, user: &UserId) -> bool;
}

/// Resolver backed by an explicit set of deactivated users; everyone else is
/// considered active.
#[derive(Clone, Debug, Default)]
pub struct InMemoryApproverResolver {
    inactive: HashSet<UserId>,
}

impl InMemoryApproverResolver {
    pub fn with_inactive_users(users: Vec<UserId>) -> Self {
        Self { inactive: users.into_iter().collect() }
    }
}

impl ApproverResolver for InMemoryApproverResolver {
    fn is_active(&self, user: &UserId) -> bool {
        !self.inactive.contains(user)
    }
}

fn ensure_unreferenced(group: &GroupId, rules: &[Rule]) -> Result<(), DirectoryError> {
    let rule_count = rules.iter().filter(|rule| rule.active && &rule.group_id == group).count();
    if rule_count > 0 {
        return Err(DirectoryError::GroupInUse { group: group.clone(), rule_count });
    }
    Ok(())
}

fn normalize_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{ApproverResolver, DirectoryError, GroupDirectory, InMemoryApproverResolver};
    use crate::domain::group::{ApproverGroup, GroupId, UserId};
    use crate::domain::rule::{Rule, RuleSubject};

    fn directory() -> GroupDirectory {
        GroupDirectory::new(vec![
            ApproverGroup::new("g-lead", "TeamLead", 5).with_member("u-lead"),
            ApproverGroup::new("g-head", "OrgHead", 8).with_member("u-head").with_member("u-dual"),
            ApproverGroup::new("g-ceo", "CEO", 10).with_member("u-ceo").with_member("u-dual"),
        ])
        .expect("valid directory")
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[test]
    fn highest_group_picks_max_priority_membership() {
        let directory = directory();
        assert_eq!(directory.highest_group(&user("u-dual")).map(|g| g.name.as_str()), Some("CEO"));
        assert_eq!(directory.highest_group(&user("u-lead")).map(|g| g.name.as_str()), Some("TeamLead"));
        assert!(directory.highest_group(&user("u-nobody")).is_none());
    }

    #[test]
    fn highest_group_outlives_the_user_lookup_key() {
        let directory = directory();
        let highest = {
            let lookup = user("u-dual");
            directory.highest_group(&lookup)
        };
        assert_eq!(highest.map(|group| group.id.0.as_str()), Some("g-ceo"));
        assert_eq!(directory.groups_of(&user("u-dual")).count(), 2);
    }

    #[test]
    fn higher_priority_member_satisfies_lower_requirement() {
        let directory = directory();
        let head = directory.get(&GroupId("g-head".to_string())).cloned().expect("head");
        let ceo = directory.get(&GroupId("g-ceo".to_string())).cloned().expect("ceo");

        assert!(directory.satisfies(&head, &user("u-ceo")));
        assert!(directory.satisfies(&head, &user("u-head")));
        assert!(!directory.satisfies(&ceo, &user("u-head")));
        assert!(!directory.satisfies(&head, &user("u-lead")));
        assert!(!directory.satisfies(&head, &user("u-nobody")));
    }

    #[test]
    fn inactive_groups_confer_no_authority() {
        let mut directory = directory();
        let head = directory.get(&GroupId("g-head".to_string())).cloned().expect("head");
        directory.deactivate(&GroupId("g-ceo".to_string()), &[]).expect("deactivate");

        assert!(!directory.satisfies(&head, &user("u-ceo")));
        assert!(!directory.is_member(&GroupId("g-ceo".to_string()), &user("u-ceo")));
        assert_eq!(
            directory.highest_group(&user("u-dual")).map(|g| g.name.as_str()),
            Some("OrgHead")
        );
    }

    #[test]
    fn group_names_are_unique_case_insensitively() {
        let mut directory = directory();
        let error = directory
            .create_group(ApproverGroup::new("g-ceo-2", " ceo ", 11))
            .expect_err("duplicate name");
        assert_eq!(error, DirectoryError::DuplicateGroupName(" ceo ".to_string()));
    }

    #[test]
    fn group_referenced_by_active_rule_cannot_be_removed() {
        let mut directory = directory();
        let mut rule = Rule::new(
            "r-1",
            RuleSubject::SheetPolicy("default".to_string()),
            "",
            GroupId("g-head".to_string()),
            1,
        );

        let error = directory
            .remove_group(&GroupId("g-head".to_string()), std::slice::from_ref(&rule))
            .expect_err("in use");
        assert_eq!(
            error,
            DirectoryError::GroupInUse { group: GroupId("g-head".to_string()), rule_count: 1 }
        );

        rule.active = false;
        directory
            .remove_group(&GroupId("g-head".to_string()), &[rule])
            .expect("inactive rules do not pin the group");
        assert!(directory.find_by_name("OrgHead").is_none());
    }

    #[test]
    fn membership_mutations_report_change() {
        let mut directory = directory();
        let lead = GroupId("g-lead".to_string());
        assert!(directory.add_member(&lead, user("u-new")).expect("add"));
        assert!(!directory.add_member(&lead, user("u-new")).expect("re-add"));
        assert!(directory.remove_member(&lead, &user("u-new")).expect("remove"));
        assert!(matches!(
            directory.add_member(&GroupId("g-missing".to_string()), user("u")),
            Err(DirectoryError::UnknownGroup(_))
        ));
    }

    #[test]
    fn resolver_treats_unlisted_users_as_active() {
        let resolver = InMemoryApproverResolver::with_inactive_users(vec![user("u-gone")]);
        assert!(resolver.is_active(&user("u-head")));
        assert!(!resolver.is_active(&user("u-gone")));
    }

    proptest! {
        #[test]
        fn satisfaction_follows_priority(user_priority in -20i32..20, required_priority in -20i32..20) {
            let directory = GroupDirectory::new(vec![
                ApproverGroup::new("g-user", "Holder", user_priority).with_member("u-x"),
                ApproverGroup::new("g-req", "Required", required_priority),
            ])
            .expect("valid directory");
            let required = directory.get(&GroupId("g-req".to_string())).cloned().expect("required");

            prop_assert_eq!(
                directory.satisfies(&required, &user("u-x")),
                user_priority >= required_priority
            );
        }
    }
}
