//! Checks a candidate approval line against the groups the applicable rules
//! require.

use serde::{Deserialize, Serialize};

use crate::condition::ApprovalContext;
use crate::domain::group::{sort_by_priority_desc, ApproverGroup, UserId};
use crate::domain::line::ApprovalLine;
use crate::domain::rule::RuleSubject;
use crate::hierarchy::GroupDirectory;
use crate::rules::{RequiredGroups, RuleSet, RuleSetError};

#[derive(Clone, Copy, Debug)]
pub struct LineValidationInput<'a> {
    pub candidate: Option<&'a ApprovalLine>,
    pub subjects: &'a [RuleSubject],
    pub context: &'a ApprovalContext,
    pub submitter: Option<&'a UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFinding {
    MissingApprovalLine { groups: Vec<String> },
    MissingApproverGroups { groups: Vec<String> },
    ExcessiveApprovers { groups: Vec<String> },
    UnnecessaryApprovalLine,
}

impl ValidationFinding {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::MissingApprovalLine { .. } | Self::MissingApproverGroups { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::MissingApprovalLine { groups } => {
                format!("approval required: {}", groups.join(", "))
            }
            Self::MissingApproverGroups { groups } => {
                format!("approval line is missing approvers for: {}", groups.join(", "))
            }
            Self::ExcessiveApprovers { groups } => format!("not required: {}", groups.join(", ")),
            Self::UnnecessaryApprovalLine => {
                "no approval is required; the selected approval line is not needed".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineValidationResult {
    /// False only when an error finding exists; excess never blocks.
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub findings: Vec<ValidationFinding>,
    pub required: RequiredGroups,
}

impl LineValidationResult {
    fn from_findings(findings: Vec<ValidationFinding>, required: RequiredGroups) -> Self {
        let errors =
            findings.iter().filter(|finding| finding.is_error()).map(|finding| finding.message()).collect();
        let warnings = findings
            .iter()
            .filter(|finding| !finding.is_error())
            .map(|finding| finding.message())
            .collect();
        let valid = !findings.iter().any(ValidationFinding::is_error);
        Self { valid, errors, warnings, findings, required }
    }

    pub fn missing_groups(&self) -> Vec<String> {
        self.findings
            .iter()
            .find_map(|finding| match finding {
                ValidationFinding::MissingApprovalLine { groups }
                | ValidationFinding::MissingApproverGroups { groups } => Some(groups.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LineValidator<'a> {
    rules: &'a RuleSet,
    directory: &'a GroupDirectory,
}

impl<'a> LineValidator<'a> {
    pub fn new(rules: &'a RuleSet, directory: &'a GroupDirectory) -> Self {
        Self { rules, directory }
    }

    pub fn validate(
        &self,
        input: &LineValidationInput<'_>,
    ) -> Result<LineValidationResult, RuleSetError> {
        let required = self.rules.required_groups_for_all(
            input.subjects,
            input.context,
            self.directory,
            input.submitter,
        )?;
        Ok(self.validate_against(input.candidate, required))
    }

    /// Validation step for callers that already aggregated the requirement.
    pub fn validate_against(
        &self,
        candidate: Option<&ApprovalLine>,
        required: RequiredGroups,
    ) -> LineValidationResult {
        let mut findings = Vec::new();

        let Some(line) = candidate else {
            if !required.is_empty() {
                findings.push(ValidationFinding::MissingApprovalLine { groups: required.names() });
            }
            return LineValidationResult::from_findings(findings, required);
        };

        if required.is_empty() {
            if !line.steps.is_empty() {
                findings.push(ValidationFinding::UnnecessaryApprovalLine);
            }
            return LineValidationResult::from_findings(findings, required);
        }

        let missing: Vec<String> = required
            .groups
            .iter()
            .filter(|group| !self.line_covers(line, group))
            .map(|group| group.name.clone())
            .collect();
        if !missing.is_empty() {
            findings.push(ValidationFinding::MissingApproverGroups { groups: missing });
        }

        let excessive = self.excessive_groups(line, &required);
        if !excessive.is_empty() {
            findings.push(ValidationFinding::ExcessiveApprovers {
                groups: excessive.iter().map(|group| group.name.clone()).collect(),
            });
        }

        LineValidationResult::from_findings(findings, required)
    }

    /// A requirement is covered by a direct member or, transitively, by any
    /// approver whose authority ranks at least as high.
    fn line_covers(&self, line: &ApprovalLine, group: &ApproverGroup) -> bool {
        line.has_approver_from_group(group)
            || line.approve_steps().any(|step| self.directory.satisfies(group, &step.approver))
    }

    /// Groups of approvers whose authority exceeds the highest requirement.
    fn excessive_groups(&self, line: &ApprovalLine, required: &RequiredGroups) -> Vec<ApproverGroup> {
        let Some(max_required) = required.max_priority() else {
            return Vec::new();
        };

        let mut excessive: Vec<ApproverGroup> = Vec::new();
        for step in line.approve_steps() {
            let Some(highest) = self.directory.highest_group(&step.approver) else {
                continue;
            };
            if highest.priority > max_required && !excessive.iter().any(|group| group.id == highest.id) {
                excessive.push(highest.clone());
            }
        }
        sort_by_priority_desc(&mut excessive);
        excessive
    }
}
