use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::condition::{ApprovalContext, Condition, ConditionParseError};
use crate::domain::group::{sort_by_priority_desc, ApproverGroup, GroupId, UserId};
use crate::domain::rule::{Rule, RuleId, RuleSubject};
use crate::hierarchy::GroupDirectory;

/// What to do with a stored rule whose condition no longer parses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnparsableConditionPolicy {
    /// Log and treat the rule as not matching, so unrelated submissions are
    /// not blocked.
    #[default]
    TreatAsFalse,
    /// Fail the evaluation with [`RuleSetError::UnparsableCondition`].
    Reject,
}

impl std::str::FromStr for UnparsableConditionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "treat_as_false" => Ok(Self::TreatAsFalse),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unsupported unparsable_condition policy `{other}` (expected treat_as_false|reject)"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RuleSetError {
    #[error("rule `{rule}` has an invalid condition: {source}")]
    InvalidCondition { rule: RuleId, source: ConditionParseError },
    #[error("rule `{rule}` could not be evaluated: {source}")]
    UnparsableCondition { rule: RuleId, source: ConditionParseError },
    #[error("rule `{rule}` targets unknown approver group `{group}`")]
    UnknownGroup { rule: RuleId, group: GroupId },
    #[error("rule `{0}` already exists")]
    DuplicateRule(RuleId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRule {
    pub rule_id: RuleId,
    pub error: String,
}

/// Outcome of aggregating rules for one approvable: the groups still
/// required plus a record of how each rule was treated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredGroups {
    /// De-duplicated, highest priority first.
    pub groups: Vec<ApproverGroup>,
    pub matched: Vec<RuleId>,
    /// Matched rules dropped because the submitter already holds the authority.
    pub waived: Vec<RuleId>,
    /// Rules ignored by the unparsable-condition fallback.
    pub skipped: Vec<SkippedRule>,
}

impl RequiredGroups {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn max_priority(&self) -> Option<i32> {
        self.groups.iter().map(|group| group.priority).max()
    }

    pub fn names(&self) -> Vec<String> {
        self.groups.iter().map(|group| group.name.clone()).collect()
    }

    pub fn contains(&self, group: &GroupId) -> bool {
        self.groups.iter().any(|existing| &existing.id == group)
    }

    /// Union of two requirement sets, keeping the ordering invariant.
    pub fn merge(mut self, other: RequiredGroups) -> RequiredGroups {
        for group in other.groups {
            if !self.contains(&group.id) {
                self.groups.push(group);
            }
        }
        sort_by_priority_desc(&mut self.groups);
        self.matched.extend(other.matched);
        self.waived.extend(other.waived);
        self.skipped.extend(other.skipped);
        self
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    rule: Rule,
    condition: Result<Condition, ConditionParseError>,
}

/// Ordered condition -> group rules, grouped by the subject they belong to.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    policy: UnparsableConditionPolicy,
}

impl RuleSet {
    pub fn new(policy: UnparsableConditionPolicy) -> Self {
        Self { rules: Vec::new(), policy }
    }

    /// Loads previously stored rules. Conditions that fail to parse are kept
    /// and handled by the configured policy at evaluation time.
    pub fn from_stored(rules: Vec<Rule>, policy: UnparsableConditionPolicy) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let condition = Condition::parse(&rule.condition);
                CompiledRule { rule, condition }
            })
            .collect();
        Self { rules, policy }
    }

    pub fn policy(&self) -> UnparsableConditionPolicy {
        self.policy
    }

    /// Authoring entry point: malformed conditions are refused here rather
    /// than discovered during a submission.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), RuleSetError> {
        if self.rules.iter().any(|existing| existing.rule.id == rule.id) {
            return Err(RuleSetError::DuplicateRule(rule.id));
        }
        let condition = Condition::parse(&rule.condition).map_err(|source| {
            RuleSetError::InvalidCondition { rule: rule.id.clone(), source }
        })?;
        self.rules.push(CompiledRule { rule, condition: Ok(condition) });
        Ok(())
    }

    pub fn set_active(&mut self, rule_id: &RuleId, active: bool) -> bool {
        match self.rules.iter_mut().find(|compiled| &compiled.rule.id == rule_id) {
            Some(compiled) => {
                compiled.rule.active = active;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    /// Active rules of `subject`, in display order.
    pub fn rules_for(&self, subject: &RuleSubject) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self
            .rules
            .iter()
            .map(|compiled| &compiled.rule)
            .filter(|rule| rule.active && &rule.subject == subject)
            .collect();
        rules.sort_by(|left, right| left.order.cmp(&right.order).then_with(|| left.id.cmp(&right.id)));
        rules
    }

    /// Stored rules whose condition does not parse, active or not.
    pub fn lint(&self) -> Vec<(RuleId, ConditionParseError)> {
        self.rules
            .iter()
            .filter_map(|compiled| match &compiled.condition {
                Ok(_) => None,
                Err(error) => Some((compiled.rule.id.clone(), error.clone())),
            })
            .collect()
    }

    /// Groups that must appear on the approval line of an approvable whose
    /// rules live under `subject`.
    pub fn required_groups(
        &self,
        subject: &RuleSubject,
        context: &ApprovalContext,
        directory: &GroupDirectory,
        submitter: Option<&UserId>,
    ) -> Result<RequiredGroups, RuleSetError> {
        let mut required = RequiredGroups::default();

        for compiled in self.compiled_for(subject) {
            let rule = &compiled.rule;
            let matches = match &compiled.condition {
                Ok(condition) => condition.evaluate(context),
                Err(error) => match self.policy {
                    UnparsableConditionPolicy::TreatAsFalse => {
                        warn!(
                            event_name = "rules.condition.unparsable",
                            rule_id = %rule.id,
                            subject = %rule.subject,
                            error = %error,
                            "rule condition does not parse; treating as not matched"
                        );
                        required
                            .skipped
                            .push(SkippedRule { rule_id: rule.id.clone(), error: error.to_string() });
                        continue;
                    }
                    UnparsableConditionPolicy::Reject => {
                        return Err(RuleSetError::UnparsableCondition {
                            rule: rule.id.clone(),
                            source: error.clone(),
                        });
                    }
                },
            };
            if !matches {
                continue;
            }

            let group = directory.get(&rule.group_id).ok_or_else(|| RuleSetError::UnknownGroup {
                rule: rule.id.clone(),
                group: rule.group_id.clone(),
            })?;
            required.matched.push(rule.id.clone());

            if submitter.is_some_and(|submitter| directory.satisfies(group, submitter)) {
                debug!(
                    event_name = "rules.requirement.waived",
                    rule_id = %rule.id,
                    group = %group.name,
                    "submitter already holds the required authority"
                );
                required.waived.push(rule.id.clone());
                continue;
            }

            if !required.contains(&group.id) {
                required.groups.push(group.clone());
            }
        }

        sort_by_priority_desc(&mut required.groups);
        Ok(required)
    }

    /// Union of [`RuleSet::required_groups`] over every subject that applies
    /// to one approvable.
    pub fn required_groups_for_all(
        &self,
        subjects: &[RuleSubject],
        context: &ApprovalContext,
        directory: &GroupDirectory,
        submitter: Option<&UserId>,
    ) -> Result<RequiredGroups, RuleSetError> {
        subjects.iter().try_fold(RequiredGroups::default(), |acc, subject| {
            Ok(acc.merge(self.required_groups(subject, context, directory, submitter)?))
        })
    }

    fn compiled_for<'a>(&'a self, subject: &'a RuleSubject) -> Vec<&'a CompiledRule> {
        let mut rules: Vec<&CompiledRule> = self
            .rules
            .iter()
            .filter(|compiled| compiled.rule.active && &compiled.rule.subject == subject)
            .collect();
        rules.sort_by(|left, right| {
            left.rule.order.cmp(&right.rule.order).then_with(|| left.rule.id.cmp(&right.rule.id))
        });
        rules
    }
}
