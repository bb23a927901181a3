use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::group::UserId;
use crate::domain::line::{ApprovalType, LineId, StepRole};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryId(pub String);

/// Opaque `{type, id}` pointer at the business object being approved.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovableRef {
    pub kind: String,
    pub id: String,
}

impl ApprovableRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }
}

impl std::fmt::Display for ApprovableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Frozen copy of one approval line step taken at submission time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequestStep {
    pub approver: UserId,
    pub step_order: u32,
    pub role: StepRole,
    pub approval_type: ApprovalType,
    pub status: StepStatus,
    pub actioned_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub approvable: ApprovableRef,
    pub approval_line_id: LineId,
    pub submitted_by: UserId,
    pub status: ApprovalStatus,
    pub current_step: u32,
    pub steps: Vec<ApprovalRequestStep>,
    /// Bumped on every committed transition; used for optimistic concurrency.
    pub version: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Steps that belong to the parallel group at `step_order`.
    pub fn group(&self, step_order: u32) -> impl Iterator<Item = &ApprovalRequestStep> {
        self.steps.iter().filter(move |step| step.step_order == step_order)
    }

    pub fn current_group(&self) -> impl Iterator<Item = &ApprovalRequestStep> {
        self.group(self.current_step)
    }

    /// Distinct step orders present on the request, ascending.
    pub fn step_orders(&self) -> Vec<u32> {
        let mut orders: Vec<u32> = self.steps.iter().map(|step| step.step_order).collect();
        orders.sort_unstable();
        orders.dedup();
        orders
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Approve,
    Reject,
    View,
    Cancel,
    Reset,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::View => "view",
            Self::Cancel => "cancel",
            Self::Reset => "reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "view" => Some(Self::View),
            "cancel" => Some(Self::Cancel),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Append-only record of one action taken on a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalHistoryEntry {
    pub id: HistoryId,
    pub request_id: ApprovalId,
    pub approver: UserId,
    pub step_order: u32,
    /// `None` for actions taken outside a step (cancel by submitter, admin reset).
    pub role: Option<StepRole>,
    pub action: HistoryAction,
    pub comment: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{ApprovalStatus, HistoryAction, StepStatus};

    #[test]
    fn status_strings_parse_back() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Cancelled,
        ] {
            assert_eq!(ApprovalStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StepStatus::parse("APPROVED"), Some(StepStatus::Approved));
        assert_eq!(HistoryAction::parse("reset"), Some(HistoryAction::Reset));
        assert_eq!(ApprovalStatus::parse("escalated"), None);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Rejected.is_terminal());
        assert!(ApprovalStatus::Cancelled.is_terminal());
    }
}
