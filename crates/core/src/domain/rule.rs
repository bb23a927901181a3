use serde::{Deserialize, Serialize};

use crate::domain::group::GroupId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a rule is attached to. Several subjects may apply to one approvable
/// (a line-item expense code and the sheet-level policy, for example).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum RuleSubject {
    ExpenseCode(String),
    SheetPolicy(String),
    TemplatePolicy(String),
}

impl RuleSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExpenseCode(_) => "expense_code",
            Self::SheetPolicy(_) => "sheet_policy",
            Self::TemplatePolicy(_) => "template_policy",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::ExpenseCode(key) | Self::SheetPolicy(key) | Self::TemplatePolicy(key) => key,
        }
    }

    pub fn parse(kind: &str, key: impl Into<String>) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "expense_code" => Some(Self::ExpenseCode(key.into())),
            "sheet_policy" => Some(Self::SheetPolicy(key.into())),
            "template_policy" => Some(Self::TemplatePolicy(key.into())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.key())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub subject: RuleSubject,
    /// Raw condition expression; blank means the rule always applies.
    pub condition: String,
    pub group_id: GroupId,
    pub order: i32,
    pub active: bool,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        subject: RuleSubject,
        condition: impl Into<String>,
        group_id: GroupId,
        order: i32,
    ) -> Self {
        Self {
            id: RuleId(id.into()),
            subject,
            condition: condition.into(),
            group_id,
            order,
            active: true,
        }
    }
}
