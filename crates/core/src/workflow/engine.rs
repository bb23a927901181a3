use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvable::Approvable;
use crate::approvals::{LineValidationInput, LineValidator, ValidationFinding};
use crate::domain::approval::{
    ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalRequestStep, ApprovalStatus,
    HistoryAction, HistoryId, StepStatus,
};
use crate::domain::group::UserId;
use crate::domain::line::{ApprovalLine, ApprovalType, StepRole};
use crate::hierarchy::{ApproverResolver, GroupDirectory};
use crate::rules::RuleSet;
use crate::workflow::states::{Actor, Submission, TransitionResult, WorkflowAction, WorkflowError};

/// Rules, groups and account state as they stand at submission time.
#[derive(Clone, Copy)]
pub struct PolicySnapshot<'a> {
    pub rules: &'a RuleSet,
    pub directory: &'a GroupDirectory,
    pub resolver: &'a dyn ApproverResolver,
}

impl<'a> PolicySnapshot<'a> {
    pub fn new(
        rules: &'a RuleSet,
        directory: &'a GroupDirectory,
        resolver: &'a dyn ApproverResolver,
    ) -> Self {
        Self { rules, directory, resolver }
    }
}

/// State machine over [`ApprovalRequest`]. Every transition takes the request
/// by value and either returns the next state plus one history entry or an
/// error with the input untouched.
#[derive(Clone, Debug, Default)]
pub struct ApprovalWorkflow;

impl ApprovalWorkflow {
    pub fn new() -> Self {
        Self
    }

    pub fn submit<A>(
        &self,
        policy: &PolicySnapshot<'_>,
        approvable: &A,
        line: Option<&ApprovalLine>,
    ) -> Result<Submission, WorkflowError>
    where
        A: Approvable + ?Sized,
    {
        let submitter = approvable.submitter();
        let subjects = approvable.rule_subjects();
        let context = approvable.approval_context();

        let validation = LineValidator::new(policy.rules, policy.directory).validate(
            &LineValidationInput {
                candidate: line,
                subjects: &subjects,
                context: &context,
                submitter: Some(&submitter),
            },
        )?;

        for finding in &validation.findings {
            match finding {
                ValidationFinding::MissingApprovalLine { groups } => {
                    return Err(WorkflowError::MissingApprovalLine { groups: groups.clone() });
                }
                ValidationFinding::MissingApproverGroups { groups } => {
                    return Err(WorkflowError::MissingApproverGroups { groups: groups.clone() });
                }
                ValidationFinding::ExcessiveApprovers { .. }
                | ValidationFinding::UnnecessaryApprovalLine => {}
            }
        }

        let Some(line) = line else {
            info!(
                event_name = "workflow.submission.not_required",
                approvable = %approvable.approvable_ref(),
                submitter = %submitter,
                "no approval required for submission"
            );
            return Ok(Submission::NotRequired { validation });
        };

        if !line.active {
            return Err(WorkflowError::LineNotUsable {
                line_id: line.id.clone(),
                reason: "line has been deactivated".to_string(),
            });
        }
        if line.owner != submitter {
            return Err(WorkflowError::LineNotUsable {
                line_id: line.id.clone(),
                reason: format!("line belongs to `{}`", line.owner),
            });
        }

        let stale: Vec<UserId> = line
            .approvers()
            .into_iter()
            .filter(|approver| !policy.resolver.is_active(approver))
            .cloned()
            .collect();
        if !stale.is_empty() {
            return Err(WorkflowError::StaleApprovalLine { approvers: stale });
        }

        let now = Utc::now();
        let steps: Vec<ApprovalRequestStep> = line
            .ordered()
            .into_iter()
            .map(|step| ApprovalRequestStep {
                approver: step.approver.clone(),
                step_order: step.step_order,
                role: step.role,
                approval_type: step.approval_type,
                status: StepStatus::Pending,
                actioned_at: None,
            })
            .collect();
        let first_step = steps.iter().map(|step| step.step_order).min().unwrap_or(0);

        let mut request = ApprovalRequest {
            id: ApprovalId(Uuid::new_v4().to_string()),
            approvable: approvable.approvable_ref(),
            approval_line_id: line.id.clone(),
            submitted_by: submitter,
            status: ApprovalStatus::Pending,
            current_step: first_step,
            steps,
            version: 1,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        position_at_or_after(&mut request, first_step, now);

        info!(
            event_name = "workflow.request.submitted",
            request_id = %request.id,
            approvable = %request.approvable,
            line_id = %request.approval_line_id,
            current_step = request.current_step,
            status = request.status.as_str(),
            "approval request submitted"
        );
        Ok(Submission::Submitted { request, validation })
    }

    pub fn approve(
        &self,
        mut request: ApprovalRequest,
        actor: &Actor,
        comment: Option<String>,
    ) -> Result<TransitionResult, WorkflowError> {
        ensure_pending(&request, WorkflowAction::Approve)?;
        let index = pending_approve_row(&request, &actor.user, WorkflowAction::Approve)?;

        let now = Utc::now();
        let from_status = request.status;
        let from_step = request.current_step;

        let holder = request.steps[index].approver.clone();
        for step in request.steps.iter_mut().filter(|step| {
            step.step_order == from_step
                && step.role == StepRole::Approve
                && step.approver == holder
                && step.status == StepStatus::Pending
        }) {
            step.status = StepStatus::Approved;
            step.actioned_at = Some(now);
        }

        if group_satisfied(&request, from_step) {
            match from_step.checked_add(1) {
                Some(next) => position_at_or_after(&mut request, next, now),
                None => complete(&mut request, now),
            }
        }
        touch(&mut request, now);

        let history = history_entry(
            &request,
            &actor.user,
            from_step,
            Some(StepRole::Approve),
            HistoryAction::Approve,
            comment,
            now,
        );

        let event_name = if request.status == ApprovalStatus::Approved {
            "workflow.request.approved"
        } else {
            "workflow.step.approved"
        };
        info!(
            event_name = event_name,
            request_id = %request.id,
            actor = %actor.user,
            step_order = from_step,
            current_step = request.current_step,
            "approval recorded"
        );

        Ok(TransitionResult { request, history, from_status, from_step })
    }

    /// A single rejection terminates the request regardless of group type.
    pub fn reject(
        &self,
        mut request: ApprovalRequest,
        actor: &Actor,
        comment: Option<String>,
    ) -> Result<TransitionResult, WorkflowError> {
        ensure_pending(&request, WorkflowAction::Reject)?;
        let index = pending_approve_row(&request, &actor.user, WorkflowAction::Reject)?;

        let now = Utc::now();
        let from_status = request.status;
        let from_step = request.current_step;

        request.steps[index].status = StepStatus::Rejected;
        request.steps[index].actioned_at = Some(now);
        request.status = ApprovalStatus::Rejected;
        request.completed_at = Some(now);
        touch(&mut request, now);

        let history = history_entry(
            &request,
            &actor.user,
            from_step,
            Some(StepRole::Approve),
            HistoryAction::Reject,
            comment,
            now,
        );
        info!(
            event_name = "workflow.request.rejected",
            request_id = %request.id,
            actor = %actor.user,
            step_order = from_step,
            "approval request rejected"
        );

        Ok(TransitionResult { request, history, from_status, from_step })
    }

    pub fn cancel(
        &self,
        mut request: ApprovalRequest,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<TransitionResult, WorkflowError> {
        ensure_pending(&request, WorkflowAction::Cancel)?;
        if actor.user != request.submitted_by && !actor.admin {
            return Err(WorkflowError::UnauthorizedActor {
                actor: actor.user.clone(),
                step_order: request.current_step,
            });
        }

        let now = Utc::now();
        let from_status = request.status;
        let from_step = request.current_step;

        request.status = ApprovalStatus::Cancelled;
        request.completed_at = Some(now);
        touch(&mut request, now);

        let history = history_entry(
            &request,
            &actor.user,
            from_step,
            None,
            HistoryAction::Cancel,
            reason,
            now,
        );
        info!(
            event_name = "workflow.request.cancelled",
            request_id = %request.id,
            actor = %actor.user,
            on_behalf = actor.user != request.submitted_by,
            "approval request cancelled"
        );

        Ok(TransitionResult { request, history, from_status, from_step })
    }

    /// Re-opens an approved request at `to_step`. Every row at or after that
    /// step returns to pending.
    pub fn reset(
        &self,
        mut request: ApprovalRequest,
        to_step: u32,
        actor: &Actor,
        reason: impl Into<String>,
    ) -> Result<TransitionResult, WorkflowError> {
        if !actor.admin {
            return Err(WorkflowError::UnauthorizedActor {
                actor: actor.user.clone(),
                step_order: to_step,
            });
        }
        if request.status != ApprovalStatus::Approved {
            return Err(WorkflowError::InvalidTransition {
                status: request.status,
                action: WorkflowAction::Reset,
                reason: "only approved requests can be reset".to_string(),
            });
        }
        if !request.step_orders().contains(&to_step) {
            return Err(WorkflowError::InvalidTransition {
                status: request.status,
                action: WorkflowAction::Reset,
                reason: format!("step {to_step} does not exist on this request"),
            });
        }
        if next_gating_step(&request, to_step).is_none() {
            return Err(WorkflowError::InvalidTransition {
                status: request.status,
                action: WorkflowAction::Reset,
                reason: format!("no approve step at or after step {to_step}"),
            });
        }

        let now = Utc::now();
        let from_status = request.status;
        let from_step = request.current_step;

        for step in request.steps.iter_mut().filter(|step| step.step_order >= to_step) {
            step.status = StepStatus::Pending;
            step.actioned_at = None;
        }
        request.status = ApprovalStatus::Pending;
        request.completed_at = None;
        position_at_or_after(&mut request, to_step, now);
        touch(&mut request, now);

        let history = history_entry(
            &request,
            &actor.user,
            to_step,
            None,
            HistoryAction::Reset,
            Some(reason.into()),
            now,
        );
        warn!(
            event_name = "workflow.request.reset",
            request_id = %request.id,
            actor = %actor.user,
            to_step = to_step,
            current_step = request.current_step,
            "approved request re-opened"
        );

        Ok(TransitionResult { request, history, from_status, from_step })
    }

    /// Records that a reference approver has seen the request. Never touches
    /// status, pointer or version.
    pub fn record_view(
        &self,
        request: &ApprovalRequest,
        actor: &Actor,
    ) -> Result<ApprovalHistoryEntry, WorkflowError> {
        let step = request
            .steps
            .iter()
            .find(|step| step.role == StepRole::Reference && step.approver == actor.user)
            .ok_or_else(|| WorkflowError::UnauthorizedActor {
                actor: actor.user.clone(),
                step_order: request.current_step,
            })?;

        Ok(history_entry(
            request,
            &actor.user,
            step.step_order,
            Some(StepRole::Reference),
            HistoryAction::View,
            None,
            Utc::now(),
        ))
    }

    pub fn can_be_approved_by(&self, request: &ApprovalRequest, user: &UserId) -> bool {
        request.is_pending()
            && request.current_group().any(|step| {
                step.role == StepRole::Approve
                    && &step.approver == user
                    && step.status == StepStatus::Pending
            })
    }

    /// Requests waiting on `user` at their current step only.
    pub fn for_approver<'r, I>(&self, requests: I, user: &UserId) -> Vec<&'r ApprovalRequest>
    where
        I: IntoIterator<Item = &'r ApprovalRequest>,
    {
        requests.into_iter().filter(|request| self.can_be_approved_by(request, user)).collect()
    }

    /// Reports pending approvers at the current step that no longer resolve.
    /// The request is left as is for manual remediation.
    pub fn verify_current_step(
        &self,
        request: &ApprovalRequest,
        resolver: &dyn ApproverResolver,
    ) -> Result<(), WorkflowError> {
        if !request.is_pending() {
            return Ok(());
        }
        let mut stale: Vec<UserId> = request
            .current_group()
            .filter(|step| step.role == StepRole::Approve && step.status == StepStatus::Pending)
            .filter(|step| !resolver.is_active(&step.approver))
            .map(|step| step.approver.clone())
            .collect();
        stale.sort();
        stale.dedup();
        if stale.is_empty() {
            return Ok(());
        }
        warn!(
            event_name = "workflow.request.stale_approvers",
            request_id = %request.id,
            current_step = request.current_step,
            stale_count = stale.len(),
            "current step references inactive approvers"
        );
        Err(WorkflowError::StaleApprovalLine { approvers: stale })
    }
}

fn ensure_pending(request: &ApprovalRequest, action: WorkflowAction) -> Result<(), WorkflowError> {
    if request.is_pending() {
        return Ok(());
    }
    Err(WorkflowError::InvalidTransition {
        status: request.status,
        action,
        reason: "request is already closed".to_string(),
    })
}

/// Index of the actor's pending approve row at the current step. An actor who
/// holds such a row but already acted gets `InvalidTransition`.
fn pending_approve_row(
    request: &ApprovalRequest,
    user: &UserId,
    action: WorkflowAction,
) -> Result<usize, WorkflowError> {
    let mut acted = false;
    for (index, step) in request.steps.iter().enumerate() {
        if step.step_order != request.current_step
            || step.role != StepRole::Approve
            || &step.approver != user
        {
            continue;
        }
        if step.status == StepStatus::Pending {
            return Ok(index);
        }
        acted = true;
    }

    if acted {
        return Err(WorkflowError::InvalidTransition {
            status: request.status,
            action,
            reason: format!("`{user}` already acted at step {}", request.current_step),
        });
    }
    Err(WorkflowError::UnauthorizedActor { actor: user.clone(), step_order: request.current_step })
}

fn group_satisfied(request: &ApprovalRequest, step_order: u32) -> bool {
    let approvers: Vec<&ApprovalRequestStep> =
        request.group(step_order).filter(|step| step.role == StepRole::Approve).collect();
    if approvers.is_empty() {
        return true;
    }
    let approved = |step: &&ApprovalRequestStep| step.status == StepStatus::Approved;
    match approvers[0].approval_type {
        ApprovalType::AnyOne => approvers.iter().any(approved),
        ApprovalType::AllRequired => approvers.iter().all(approved),
    }
}

/// Lowest step order `>= from` that contains an approve step.
fn next_gating_step(request: &ApprovalRequest, from: u32) -> Option<u32> {
    request.step_orders().into_iter().filter(|order| *order >= from).find(|order| {
        request.group(*order).any(|step| step.role == StepRole::Approve)
    })
}

/// Moves the pointer to the next gating step, or completes the request when
/// none remains.
fn position_at_or_after(request: &mut ApprovalRequest, from: u32, now: DateTime<Utc>) {
    match next_gating_step(request, from) {
        Some(order) => request.current_step = order,
        None => complete(request, now),
    }
}

fn complete(request: &mut ApprovalRequest, now: DateTime<Utc>) {
    request.status = ApprovalStatus::Approved;
    request.completed_at = Some(now);
}

fn touch(request: &mut ApprovalRequest, now: DateTime<Utc>) {
    request.version += 1;
    request.updated_at = now;
}

fn history_entry(
    request: &ApprovalRequest,
    user: &UserId,
    step_order: u32,
    role: Option<StepRole>,
    action: HistoryAction,
    comment: Option<String>,
    now: DateTime<Utc>,
) -> ApprovalHistoryEntry {
    ApprovalHistoryEntry {
        id: HistoryId(Uuid::new_v4().to_string()),
        request_id: request.id.clone(),
        approver: user.clone(),
        step_order,
        role,
        action,
        comment: comment.filter(|text| !text.trim().is_empty()),
        occurred_at: now,
    }
}
