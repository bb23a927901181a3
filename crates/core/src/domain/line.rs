use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::group::{ApproverGroup, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineId(pub String);

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    Approve,
    Reference,
}

impl StepRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reference => "reference",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reference" => Some(Self::Reference),
            _ => None,
        }
    }
}

/// Consensus rule for the `approve` steps of one parallel group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    #[default]
    AllRequired,
    AnyOne,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllRequired => "all_required",
            Self::AnyOne => "any_one",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all_required" => Some(Self::AllRequired),
            "any_one" => Some(Self::AnyOne),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLineStep {
    pub id: StepId,
    pub step_order: u32,
    pub approver: UserId,
    pub role: StepRole,
    pub approval_type: ApprovalType,
}

impl ApprovalLineStep {
    pub fn approve(id: impl Into<String>, step_order: u32, approver: impl Into<String>) -> Self {
        Self {
            id: StepId(id.into()),
            step_order,
            approver: UserId(approver.into()),
            role: StepRole::Approve,
            approval_type: ApprovalType::AllRequired,
        }
    }

    pub fn reference(id: impl Into<String>, step_order: u32, approver: impl Into<String>) -> Self {
        Self { role: StepRole::Reference, ..Self::approve(id, step_order, approver) }
    }

    pub fn with_approval_type(mut self, approval_type: ApprovalType) -> Self {
        self.approval_type = approval_type;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("step order must be a positive integer (got {0})")]
    InvalidStepOrder(u32),
    #[error("step `{0}` already exists on the line")]
    DuplicateStep(String),
    #[error("`{approver}` already holds a step in parallel group {step_order}")]
    DuplicateApprover { step_order: u32, approver: String },
    #[error("step `{0}` does not exist on the line")]
    UnknownStep(String),
    #[error(
        "parallel group {step_order} already uses approval type `{existing}`, cannot add `{requested}`"
    )]
    MixedApprovalType { step_order: u32, existing: &'static str, requested: &'static str },
    #[error("approval line `{0}` does not exist")]
    UnknownLine(String),
    #[error("approval line `{line_id}` is not owned by `{owner}`")]
    NotOwner { line_id: String, owner: String },
    #[error("reorder must list every active line of `{owner}` exactly once")]
    NotAPermutation { owner: String },
}

/// A user-owned reusable template of who approves that user's submissions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLine {
    pub id: LineId,
    pub owner: UserId,
    pub name: String,
    pub active: bool,
    pub display_order: u32,
    pub steps: Vec<ApprovalLineStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalLine {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: LineId(id.into()),
            owner: UserId(owner.into()),
            name: name.into(),
            active: true,
            display_order: 0,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_step(mut self, step: ApprovalLineStep) -> Result<Self, LineError> {
        self.add_step(step)?;
        Ok(self)
    }

    /// Steps sorted by step order; insertion order is kept inside a parallel group.
    pub fn ordered(&self) -> Vec<&ApprovalLineStep> {
        let mut steps: Vec<&ApprovalLineStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.step_order);
        steps
    }

    pub fn parallel_groups(&self) -> BTreeMap<u32, Vec<&ApprovalLineStep>> {
        let mut groups: BTreeMap<u32, Vec<&ApprovalLineStep>> = BTreeMap::new();
        for step in &self.steps {
            groups.entry(step.step_order).or_default().push(step);
        }
        groups
    }

    pub fn approve_steps(&self) -> impl Iterator<Item = &ApprovalLineStep> {
        self.steps.iter().filter(|step| step.role == StepRole::Approve)
    }

    pub fn approvers(&self) -> Vec<&UserId> {
        let mut approvers: Vec<&UserId> = Vec::new();
        for step in self.ordered() {
            if !approvers.contains(&&step.approver) {
                approvers.push(&step.approver);
            }
        }
        approvers
    }

    /// True if any `approve` step is held by a direct member of `group`.
    pub fn has_approver_from_group(&self, group: &ApproverGroup) -> bool {
        self.approve_steps().any(|step| group.is_member(&step.approver))
    }

    pub fn add_step(&mut self, step: ApprovalLineStep) -> Result<(), LineError> {
        if self.steps.iter().any(|existing| existing.id == step.id) {
            return Err(LineError::DuplicateStep(step.id.0));
        }
        self.check_step(&step, None)?;
        self.steps.push(step);
        self.touch();
        Ok(())
    }

    pub fn update_step(&mut self, step: ApprovalLineStep) -> Result<(), LineError> {
        let index = self
            .steps
            .iter()
            .position(|existing| existing.id == step.id)
            .ok_or_else(|| LineError::UnknownStep(step.id.0.clone()))?;
        self.check_step(&step, Some(&step.id))?;
        self.steps[index] = step;
        self.touch();
        Ok(())
    }

    pub fn remove_step(&mut self, step_id: &StepId) -> Result<ApprovalLineStep, LineError> {
        let index = self
            .steps
            .iter()
            .position(|existing| &existing.id == step_id)
            .ok_or_else(|| LineError::UnknownStep(step_id.0.clone()))?;
        let removed = self.steps.remove(index);
        self.touch();
        Ok(removed)
    }

    fn check_step(
        &self,
        step: &ApprovalLineStep,
        replacing: Option<&StepId>,
    ) -> Result<(), LineError> {
        if step.step_order == 0 {
            return Err(LineError::InvalidStepOrder(step.step_order));
        }
        let repeated = self.steps.iter().filter(|existing| Some(&existing.id) != replacing).any(
            |existing| existing.step_order == step.step_order && existing.approver == step.approver,
        );
        if repeated {
            return Err(LineError::DuplicateApprover {
                step_order: step.step_order,
                approver: step.approver.0.clone(),
            });
        }
        if step.role != StepRole::Approve {
            return Ok(());
        }

        let conflicting = self
            .approve_steps()
            .filter(|existing| Some(&existing.id) != replacing)
            .find(|existing| {
                existing.step_order == step.step_order
                    && existing.approval_type != step.approval_type
            });
        match conflicting {
            Some(existing) => Err(LineError::MixedApprovalType {
                step_order: step.step_order,
                existing: existing.approval_type.as_str(),
                requested: step.approval_type.as_str(),
            }),
            None => Ok(()),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
