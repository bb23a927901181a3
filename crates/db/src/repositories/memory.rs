use std::collections::HashMap;

use tokio::sync::RwLock;

use expensa_core::domain::approval::{
    ApprovableRef, ApprovalHistoryEntry, ApprovalId, ApprovalRequest,
};
use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};
use expensa_core::domain::line::{ApprovalLine, LineId};
use expensa_core::domain::rule::{Rule, RuleId, RuleSubject};
use expensa_core::workflow::ApprovalWorkflow;

use super::{
    ApprovalRequestRepository, GroupRepository, LineRepository, RepositoryError, RuleRepository,
};

#[derive(Default)]
pub struct InMemoryGroupRepository {
    groups: RwLock<HashMap<String, ApproverGroup>>,
}

#[async_trait::async_trait]
impl GroupRepository for InMemoryGroupRepository {
    async fn list(&self) -> Result<Vec<ApproverGroup>, RepositoryError> {
        let groups = self.groups.read().await;
        let mut listed: Vec<ApproverGroup> = groups.values().cloned().collect();
        listed.sort_by(|left, right| {
            right.priority.cmp(&left.priority).then_with(|| left.name.cmp(&right.name))
        });
        Ok(listed)
    }

    async fn find_by_id(&self, id: &GroupId) -> Result<Option<ApproverGroup>, RepositoryError> {
        let groups = self.groups.read().await;
        Ok(groups.get(&id.0).cloned())
    }

    async fn save(&self, group: ApproverGroup) -> Result<(), RepositoryError> {
        let mut groups = self.groups.write().await;
        let name_taken = groups.values().any(|existing| {
            existing.id != group.id && existing.name.eq_ignore_ascii_case(&group.name)
        });
        if name_taken {
            return Err(RepositoryError::AlreadyExists {
                entity: "approver group name",
                id: group.name,
            });
        }
        groups.insert(group.id.0.clone(), group);
        Ok(())
    }

    async fn delete(&self, id: &GroupId) -> Result<bool, RepositoryError> {
        let mut groups = self.groups.write().await;
        Ok(groups.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, Rule>>,
}

#[async_trait::async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list(&self) -> Result<Vec<Rule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut listed: Vec<Rule> = rules.values().cloned().collect();
        listed.sort_by(|left, right| {
            left.subject
                .kind()
                .cmp(right.subject.kind())
                .then_with(|| left.subject.key().cmp(right.subject.key()))
                .then_with(|| left.order.cmp(&right.order))
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(listed)
    }

    async fn list_for_subjects(
        &self,
        subjects: &[RuleSubject],
    ) -> Result<Vec<Rule>, RepositoryError> {
        Ok(self.list().await?.into_iter().filter(|rule| subjects.contains(&rule.subject)).collect())
    }

    async fn save(&self, rule: Rule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        Ok(rules.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryLineRepository {
    lines: RwLock<HashMap<String, ApprovalLine>>,
}

#[async_trait::async_trait]
impl LineRepository for InMemoryLineRepository {
    async fn find_by_id(&self, id: &LineId) -> Result<Option<ApprovalLine>, RepositoryError> {
        let lines = self.lines.read().await;
        Ok(lines.get(&id.0).cloned())
    }

    async fn list_for_owner(&self, owner: &UserId) -> Result<Vec<ApprovalLine>, RepositoryError> {
        let lines = self.lines.read().await;
        let mut owned: Vec<ApprovalLine> =
            lines.values().filter(|line| &line.owner == owner).cloned().collect();
        owned.sort_by(|left, right| {
            left.display_order
                .cmp(&right.display_order)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(owned)
    }

    async fn save_all(&self, lines: Vec<ApprovalLine>) -> Result<(), RepositoryError> {
        let mut stored = self.lines.write().await;
        for line in lines {
            stored.insert(line.id.0.clone(), line);
        }
        Ok(())
    }
}

#[derive(Default)]
struct ApprovalStore {
    requests: HashMap<String, ApprovalRequest>,
    histories: HashMap<String, Vec<ApprovalHistoryEntry>>,
}

/// Requests and their history behind one lock, so a transition's version
/// check and both writes happen together.
#[derive(Default)]
pub struct InMemoryApprovalRequestRepository {
    store: RwLock<ApprovalStore>,
}

#[async_trait::async_trait]
impl ApprovalRequestRepository for InMemoryApprovalRequestRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.requests.get(&id.0).cloned())
    }

    async fn find_by_approvable(
        &self,
        approvable: &ApprovableRef,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let store = self.store.read().await;
        let mut found: Vec<ApprovalRequest> = store
            .requests
            .values()
            .filter(|request| &request.approvable == approvable)
            .cloned()
            .collect();
        found.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(found)
    }

    async fn insert(&self, request: ApprovalRequest) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        if store.requests.contains_key(&request.id.0) {
            return Err(RepositoryError::AlreadyExists {
                entity: "approval request",
                id: request.id.0,
            });
        }
        store.requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn commit_transition(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        history: &ApprovalHistoryEntry,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        let current = store.requests.get(&request.id.0).map(|stored| stored.version);
        if current != Some(expected_version) {
            return Err(RepositoryError::VersionConflict {
                request_id: request.id.0.clone(),
                expected: expected_version,
            });
        }
        store.requests.insert(request.id.0.clone(), request.clone());
        store.histories.entry(request.id.0.clone()).or_default().push(history.clone());
        Ok(())
    }

    async fn append_history(&self, entry: &ApprovalHistoryEntry) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        store.histories.entry(entry.request_id.0.clone()).or_default().push(entry.clone());
        Ok(())
    }

    async fn history(&self, id: &ApprovalId) -> Result<Vec<ApprovalHistoryEntry>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.histories.get(&id.0).cloned().unwrap_or_default())
    }

    async fn for_approver(&self, user: &UserId) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let store = self.store.read().await;
        let mut waiting: Vec<ApprovalRequest> = ApprovalWorkflow::new()
            .for_approver(store.requests.values(), user)
            .into_iter()
            .cloned()
            .collect();
        waiting.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(waiting)
    }
}
