use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use expensa_core::approvable::Approvable;
use expensa_core::approvals::{LineValidationInput, LineValidationResult, LineValidator};
use expensa_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use expensa_core::condition::ConditionParseError;
use expensa_core::config::AppConfig;
use expensa_core::domain::approval::{
    ApprovableRef, ApprovalHistoryEntry, ApprovalId, ApprovalRequest,
};
use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};
use expensa_core::domain::line::{ApprovalLine, LineError, LineId};
use expensa_core::domain::rule::{Rule, RuleId};
use expensa_core::errors::{ApplicationError, DomainError};
use expensa_core::hierarchy::{
    ApproverResolver, DirectoryError, GroupDirectory, InMemoryApproverResolver,
};
use expensa_core::lines::ApprovalLineBook;
use expensa_core::rules::{RequiredGroups, RuleSet, RuleSetError, UnparsableConditionPolicy};
use expensa_core::workflow::{
    Actor, ApprovalWorkflow, PolicySnapshot, Submission, TransitionResult, WorkflowAction,
    WorkflowError,
};

use crate::repositories::{
    ApprovalRequestRepository, GroupRepository, InMemoryApprovalRequestRepository,
    InMemoryGroupRepository, InMemoryLineRepository, InMemoryRuleRepository, LineRepository,
    RepositoryError, RuleRepository, SqlApprovalRequestRepository, SqlGroupRepository,
    SqlLineRepository, SqlRuleRepository,
};
use crate::DbPool;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Rules(#[from] RuleSetError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Line(#[from] LineError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("approval request `{request_id}` kept changing; gave up after {attempts} attempt(s)")]
    Conflict { request_id: String, attempts: u32 },
}

impl From<ServiceError> for ApplicationError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Workflow(error) => Self::Domain(DomainError::Workflow(error)),
            ServiceError::Rules(error) => Self::Domain(DomainError::Rules(error)),
            ServiceError::Directory(error) => Self::Domain(DomainError::Directory(error)),
            ServiceError::Line(error) => Self::Domain(DomainError::Line(error)),
            ServiceError::NotFound { entity, id } => Self::NotFound(format!("{entity} `{id}`")),
            error @ ServiceError::Conflict { .. } => Self::Conflict(error.to_string()),
            ServiceError::Repository(error @ RepositoryError::VersionConflict { .. })
            | ServiceError::Repository(error @ RepositoryError::AlreadyExists { .. }) => {
                Self::Conflict(error.to_string())
            }
            ServiceError::Repository(error) => Self::Persistence(error.to_string()),
        }
    }
}

/// The four stores the service reads and writes.
#[derive(Clone)]
pub struct Repositories {
    pub groups: Arc<dyn GroupRepository>,
    pub rules: Arc<dyn RuleRepository>,
    pub lines: Arc<dyn LineRepository>,
    pub requests: Arc<dyn ApprovalRequestRepository>,
}

impl Repositories {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            groups: Arc::new(SqlGroupRepository::new(pool.clone())),
            rules: Arc::new(SqlRuleRepository::new(pool.clone())),
            lines: Arc::new(SqlLineRepository::new(pool.clone())),
            requests: Arc::new(SqlApprovalRequestRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            groups: Arc::new(InMemoryGroupRepository::default()),
            rules: Arc::new(InMemoryRuleRepository::default()),
            lines: Arc::new(InMemoryLineRepository::default()),
            requests: Arc::new(InMemoryApprovalRequestRepository::default()),
        }
    }
}

/// Application-level orchestration around [`ApprovalWorkflow`].
///
/// Every state-changing call loads the request, applies one engine
/// transition and commits it against the version it read. A commit that
/// loses a version race is re-loaded and re-applied up to
/// `max_conflict_retries` times, so a concurrent approver of an `any_one`
/// group sees the already-advanced request and is refused instead of
/// advancing it a second time.
pub struct ApprovalService {
    repositories: Repositories,
    resolver: Arc<dyn ApproverResolver + Send + Sync>,
    audit: Arc<dyn AuditSink>,
    workflow: ApprovalWorkflow,
    unparsable_condition: UnparsableConditionPolicy,
    max_conflict_retries: u32,
}

impl ApprovalService {
    pub fn new(repositories: Repositories) -> Self {
        Self {
            repositories,
            resolver: Arc::new(InMemoryApproverResolver::default()),
            audit: Arc::new(NoopAuditSink),
            workflow: ApprovalWorkflow::new(),
            unparsable_condition: UnparsableConditionPolicy::default(),
            max_conflict_retries: 3,
        }
    }

    pub fn from_config(repositories: Repositories, config: &AppConfig) -> Self {
        Self::new(repositories)
            .with_unparsable_condition(config.rules.unparsable_condition)
            .with_max_conflict_retries(config.workflow.max_conflict_retries)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ApproverResolver + Send + Sync>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_unparsable_condition(mut self, policy: UnparsableConditionPolicy) -> Self {
        self.unparsable_condition = policy;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub async fn submit<A>(
        &self,
        approvable: &A,
        line_id: Option<&LineId>,
        context: &AuditContext,
    ) -> Result<Submission, ServiceError>
    where
        A: Approvable + Sync + ?Sized,
    {
        let line = match line_id {
            Some(id) => Some(self.load_line(id).await?),
            None => None,
        };
        let directory = self.directory().await?;
        let rules = self.rules_for(approvable).await?;

        let submitted = {
            let policy = PolicySnapshot::new(&rules, &directory, self.resolver.as_ref());
            self.workflow.submit(&policy, approvable, line.as_ref())
        };
        let submission = match submitted {
            Ok(submission) => submission,
            Err(error) => {
                self.audit.emit(AuditEvent::transition_rejected(
                    context,
                    WorkflowAction::Submit,
                    &error,
                ));
                return Err(error.into());
            }
        };

        if let Submission::Submitted { request, .. } = &submission {
            self.repositories.requests.insert(request.clone()).await?;
            self.audit.emit(
                AuditEvent::new(
                    &AuditContext { request_id: Some(request.id.clone()), ..context.clone() },
                    "workflow.submit.applied",
                    AuditCategory::Workflow,
                    AuditOutcome::Success,
                )
                .with_metadata("approvable", request.approvable.to_string())
                .with_metadata("line_id", request.approval_line_id.to_string())
                .with_metadata("to_status", request.status.as_str())
                .with_metadata("to_step", request.current_step.to_string()),
            );
        }
        Ok(submission)
    }

    pub async fn approve(
        &self,
        request_id: &ApprovalId,
        actor: &Actor,
        comment: Option<String>,
        context: &AuditContext,
    ) -> Result<TransitionResult, ServiceError> {
        self.transition(request_id, WorkflowAction::Approve, context, |request| {
            self.workflow.approve(request, actor, comment.clone())
        })
        .await
    }

    pub async fn reject(
        &self,
        request_id: &ApprovalId,
        actor: &Actor,
        comment: Option<String>,
        context: &AuditContext,
    ) -> Result<TransitionResult, ServiceError> {
        self.transition(request_id, WorkflowAction::Reject, context, |request| {
            self.workflow.reject(request, actor, comment.clone())
        })
        .await
    }

    pub async fn cancel(
        &self,
        request_id: &ApprovalId,
        actor: &Actor,
        reason: Option<String>,
        context: &AuditContext,
    ) -> Result<TransitionResult, ServiceError> {
        self.transition(request_id, WorkflowAction::Cancel, context, |request| {
            self.workflow.cancel(request, actor, reason.clone())
        })
        .await
    }

    pub async fn reset(
        &self,
        request_id: &ApprovalId,
        to_step: u32,
        actor: &Actor,
        reason: &str,
        context: &AuditContext,
    ) -> Result<TransitionResult, ServiceError> {
        self.transition(request_id, WorkflowAction::Reset, context, |request| {
            self.workflow.reset(request, to_step, actor, reason)
        })
        .await
    }

    pub async fn record_view(
        &self,
        request_id: &ApprovalId,
        actor: &Actor,
    ) -> Result<ApprovalHistoryEntry, ServiceError> {
        let request = self.load_request(request_id).await?;
        let entry = self.workflow.record_view(&request, actor)?;
        self.repositories.requests.append_history(&entry).await?;
        Ok(entry)
    }

    pub async fn can_be_approved_by(
        &self,
        request_id: &ApprovalId,
        user: &UserId,
    ) -> Result<bool, ServiceError> {
        let request = self.load_request(request_id).await?;
        Ok(self.workflow.can_be_approved_by(&request, user))
    }

    pub async fn for_approver(&self, user: &UserId) -> Result<Vec<ApprovalRequest>, ServiceError> {
        Ok(self.repositories.requests.for_approver(user).await?)
    }

    pub async fn request(&self, request_id: &ApprovalId) -> Result<ApprovalRequest, ServiceError> {
        self.load_request(request_id).await
    }

    pub async fn requests_for(
        &self,
        approvable: &ApprovableRef,
    ) -> Result<Vec<ApprovalRequest>, ServiceError> {
        Ok(self.repositories.requests.find_by_approvable(approvable).await?)
    }

    pub async fn history(
        &self,
        request_id: &ApprovalId,
    ) -> Result<Vec<ApprovalHistoryEntry>, ServiceError> {
        self.load_request(request_id).await?;
        Ok(self.repositories.requests.history(request_id).await?)
    }

    pub async fn verify_current_step(&self, request_id: &ApprovalId) -> Result<(), ServiceError> {
        let request = self.load_request(request_id).await?;
        Ok(self.workflow.verify_current_step(&request, self.resolver.as_ref())?)
    }

    pub async fn required_groups<A>(&self, approvable: &A) -> Result<RequiredGroups, ServiceError>
    where
        A: Approvable + Sync + ?Sized,
    {
        let directory = self.directory().await?;
        let rules = self.rules_for(approvable).await?;
        let submitter = approvable.submitter();
        Ok(rules.required_groups_for_all(
            &approvable.rule_subjects(),
            &approvable.approval_context(),
            &directory,
            Some(&submitter),
        )?)
    }

    pub async fn validate<A>(
        &self,
        approvable: &A,
        line_id: Option<&LineId>,
    ) -> Result<LineValidationResult, ServiceError>
    where
        A: Approvable + Sync + ?Sized,
    {
        let line = match line_id {
            Some(id) => Some(self.load_line(id).await?),
            None => None,
        };
        let directory = self.directory().await?;
        let rules = self.rules_for(approvable).await?;
        let submitter = approvable.submitter();
        let subjects = approvable.rule_subjects();
        let context = approvable.approval_context();

        Ok(LineValidator::new(&rules, &directory).validate(&LineValidationInput {
            candidate: line.as_ref(),
            subjects: &subjects,
            context: &context,
            submitter: Some(&submitter),
        })?)
    }

    pub async fn create_group(&self, group: ApproverGroup) -> Result<(), ServiceError> {
        let mut directory = self.directory().await?;
        directory.create_group(group.clone())?;
        self.repositories.groups.save(group).await?;
        Ok(())
    }

    pub async fn add_member(&self, group_id: &GroupId, user: UserId) -> Result<bool, ServiceError> {
        let mut group = self.load_group(group_id).await?;
        let added = group.members.insert(user);
        if added {
            self.repositories.groups.save(group).await?;
        }
        Ok(added)
    }

    pub async fn remove_member(&self, group_id: &GroupId, user: &UserId) -> Result<bool, ServiceError> {
        let mut group = self.load_group(group_id).await?;
        let removed = group.members.remove(user);
        if removed {
            self.repositories.groups.save(group).await?;
        }
        Ok(removed)
    }

    pub async fn deactivate_group(&self, group_id: &GroupId) -> Result<(), ServiceError> {
        let mut directory = self.directory().await?;
        let rules = self.repositories.rules.list().await?;
        directory.deactivate(group_id, &rules)?;
        let mut group = self.load_group(group_id).await?;
        group.active = false;
        self.repositories.groups.save(group).await?;
        info!(event_name = "service.group.deactivated", group_id = %group_id, "approver group deactivated");
        Ok(())
    }

    /// Stores a rule after checking its condition parses and its group exists.
    pub async fn add_rule(&self, rule: Rule) -> Result<(), ServiceError> {
        if self.repositories.groups.find_by_id(&rule.group_id).await?.is_none() {
            return Err(RuleSetError::UnknownGroup {
                rule: rule.id.clone(),
                group: rule.group_id.clone(),
            }
            .into());
        }
        let mut existing =
            RuleSet::from_stored(self.repositories.rules.list().await?, self.unparsable_condition);
        existing.add_rule(rule.clone())?;
        self.repositories.rules.save(rule).await?;
        Ok(())
    }

    pub async fn set_rule_active(&self, rule_id: &RuleId, active: bool) -> Result<(), ServiceError> {
        let mut rule = self
            .repositories
            .rules
            .list()
            .await?
            .into_iter()
            .find(|rule| &rule.id == rule_id)
            .ok_or_else(|| ServiceError::NotFound { entity: "rule", id: rule_id.0.clone() })?;
        rule.active = active;
        self.repositories.rules.save(rule).await?;
        Ok(())
    }

    /// Stored rules whose condition no longer parses.
    pub async fn lint_rules(&self) -> Result<Vec<(RuleId, ConditionParseError)>, ServiceError> {
        let rules =
            RuleSet::from_stored(self.repositories.rules.list().await?, self.unparsable_condition);
        Ok(rules.lint())
    }

    /// Adds a new line at the end of its owner's listing, or replaces an
    /// existing one in place.
    pub async fn save_line(&self, line: ApprovalLine) -> Result<ApprovalLine, ServiceError> {
        let existing = self.repositories.lines.find_by_id(&line.id).await?;
        let saved = match existing {
            Some(current) => ApprovalLine { display_order: current.display_order, ..line },
            None => {
                let mut book =
                    ApprovalLineBook::new(self.repositories.lines.list_for_owner(&line.owner).await?);
                book.insert(line).clone()
            }
        };
        self.repositories.lines.save_all(vec![saved.clone()]).await?;
        Ok(saved)
    }

    /// Active lines of `owner`, in display order.
    pub async fn lines_for(&self, owner: &UserId) -> Result<Vec<ApprovalLine>, ServiceError> {
        let book = ApprovalLineBook::new(self.repositories.lines.list_for_owner(owner).await?);
        Ok(book.lines_for(owner).into_iter().cloned().collect())
    }

    pub async fn reorder_lines(
        &self,
        owner: &UserId,
        ordered_ids: &[LineId],
    ) -> Result<(), ServiceError> {
        let mut book = ApprovalLineBook::new(self.repositories.lines.list_for_owner(owner).await?);
        book.reorder(owner, ordered_ids)?;
        let reordered: Vec<ApprovalLine> = book.lines_for(owner).into_iter().cloned().collect();
        self.repositories.lines.save_all(reordered).await?;
        Ok(())
    }

    pub async fn deactivate_line(&self, owner: &UserId, line_id: &LineId) -> Result<(), ServiceError> {
        let line = self.load_line(line_id).await?;
        let mut book = ApprovalLineBook::new(vec![line]);
        book.deactivate(owner, line_id)?;
        if let Some(line) = book.get(line_id) {
            self.repositories.lines.save_all(vec![line.clone()]).await?;
        }
        Ok(())
    }

    async fn transition<F>(
        &self,
        request_id: &ApprovalId,
        action: WorkflowAction,
        context: &AuditContext,
        apply: F,
    ) -> Result<TransitionResult, ServiceError>
    where
        F: Fn(ApprovalRequest) -> Result<TransitionResult, WorkflowError>,
    {
        let context = AuditContext { request_id: Some(request_id.clone()), ..context.clone() };

        for attempt in 0..=self.max_conflict_retries {
            let request = self.load_request(request_id).await?;
            let expected_version = request.version;

            let result = match apply(request) {
                Ok(result) => result,
                Err(error) => {
                    self.audit.emit(AuditEvent::transition_rejected(&context, action, &error));
                    return Err(error.into());
                }
            };

            match self
                .repositories
                .requests
                .commit_transition(&result.request, expected_version, &result.history)
                .await
            {
                Ok(()) => {
                    self.audit.emit(AuditEvent::transition_applied(&context, action, &result));
                    return Ok(result);
                }
                Err(RepositoryError::VersionConflict { .. }) => {
                    warn!(
                        event_name = "service.transition.conflict_retry",
                        request_id = %request_id,
                        correlation_id = %context.correlation_id,
                        action = action.as_str(),
                        attempt,
                        max_retries = self.max_conflict_retries,
                        "approval request changed concurrently; reloading"
                    );
                }
                Err(error) => {
                    self.audit.emit(
                        AuditEvent::new(
                            &context,
                            format!("workflow.{}.failed", action.as_str()),
                            AuditCategory::Persistence,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("error", error.to_string()),
                    );
                    return Err(error.into());
                }
            }
        }

        self.audit.emit(
            AuditEvent::new(
                &context,
                format!("workflow.{}.failed", action.as_str()),
                AuditCategory::Persistence,
                AuditOutcome::Failed,
            )
            .with_metadata("error", "version conflict retries exhausted"),
        );
        Err(ServiceError::Conflict {
            request_id: request_id.0.clone(),
            attempts: self.max_conflict_retries + 1,
        })
    }

    async fn load_request(&self, id: &ApprovalId) -> Result<ApprovalRequest, ServiceError> {
        self.repositories
            .requests
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound { entity: "approval request", id: id.0.clone() })
    }

    async fn load_line(&self, id: &LineId) -> Result<ApprovalLine, ServiceError> {
        self.repositories
            .lines
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound { entity: "approval line", id: id.0.clone() })
    }

    async fn load_group(&self, id: &GroupId) -> Result<ApproverGroup, ServiceError> {
        self.repositories
            .groups
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound { entity: "approver group", id: id.0.clone() })
    }

    async fn directory(&self) -> Result<GroupDirectory, ServiceError> {
        Ok(GroupDirectory::new(self.repositories.groups.list().await?)?)
    }

    async fn rules_for<A>(&self, approvable: &A) -> Result<RuleSet, ServiceError>
    where
        A: Approvable + Sync + ?Sized,
    {
        let stored =
            self.repositories.rules.list_for_subjects(&approvable.rule_subjects()).await?;
        Ok(RuleSet::from_stored(stored, self.unparsable_condition))
    }
}
