use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::LineValidationResult;
use crate::domain::approval::{ApprovalHistoryEntry, ApprovalRequest, ApprovalStatus};
use crate::domain::group::UserId;
use crate::domain::line::LineId;
use crate::rules::RuleSetError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Submit,
    Approve,
    Reject,
    Cancel,
    Reset,
    View,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Reset => "reset",
            Self::View => "view",
        }
    }
}

impl std::fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user performing an action. `admin` unlocks cancel-on-behalf and reset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    pub admin: bool,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self { user: UserId(id.into()), admin: false }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self { user: UserId(id.into()), admin: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionResult {
    pub request: ApprovalRequest,
    pub history: ApprovalHistoryEntry,
    pub from_status: ApprovalStatus,
    pub from_step: u32,
}

impl TransitionResult {
    pub fn advanced(&self) -> bool {
        self.request.current_step != self.from_step || self.request.status != self.from_status
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Submission {
    Submitted { request: ApprovalRequest, validation: LineValidationResult },
    /// No rule requires approval and no line was chosen; nothing is created.
    NotRequired { validation: LineValidationResult },
}

impl Submission {
    pub fn request(&self) -> Option<&ApprovalRequest> {
        match self {
            Self::Submitted { request, .. } => Some(request),
            Self::NotRequired { .. } => None,
        }
    }

    pub fn validation(&self) -> &LineValidationResult {
        match self {
            Self::Submitted { validation, .. } | Self::NotRequired { validation } => validation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("approval required: {}", .groups.join(", "))]
    MissingApprovalLine { groups: Vec<String> },
    #[error("approval line is missing approvers for: {}", .groups.join(", "))]
    MissingApproverGroups { groups: Vec<String> },
    #[error("`{actor}` is not a pending approver at step {step_order}")]
    UnauthorizedActor { actor: UserId, step_order: u32 },
    #[error("cannot {action} a {} request: {reason}", .status.as_str())]
    InvalidTransition { status: ApprovalStatus, action: WorkflowAction, reason: String },
    #[error("approval line references approvers that no longer resolve: {}", join_users(.approvers))]
    StaleApprovalLine { approvers: Vec<UserId> },
    #[error("approval line `{line_id}` cannot be used: {reason}")]
    LineNotUsable { line_id: LineId, reason: String },
    #[error(transparent)]
    Rules(#[from] RuleSetError),
}

impl WorkflowError {
    /// Validation failures are reportable to the end user as group lists.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingApprovalLine { .. } | Self::MissingApproverGroups { .. })
    }
}

fn join_users(users: &[UserId]) -> String {
    users.iter().map(|user| user.0.as_str()).collect::<Vec<_>>().join(", ")
}
