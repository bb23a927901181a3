use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use expensa_core::domain::approval::{
    ApprovableRef, ApprovalHistoryEntry, ApprovalId, ApprovalRequest,
};
use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};
use expensa_core::domain::line::{ApprovalLine, LineId};
use expensa_core::domain::rule::{Rule, RuleId, RuleSubject};

pub mod approval;
pub mod group;
pub mod line;
pub mod memory;
pub mod rule;

pub use approval::SqlApprovalRequestRepository;
pub use group::SqlGroupRepository;
pub use line::SqlLineRepository;
pub use memory::{
    InMemoryApprovalRequestRepository, InMemoryGroupRepository, InMemoryLineRepository,
    InMemoryRuleRepository,
};
pub use rule::SqlRuleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("approval request `{request_id}` changed since version {expected}")]
    VersionConflict { request_id: String, expected: u32 },
    #[error("{entity} `{id}` already exists")]
    AlreadyExists { entity: &'static str, id: String },
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<ApproverGroup>, RepositoryError>;
    async fn find_by_id(&self, id: &GroupId) -> Result<Option<ApproverGroup>, RepositoryError>;
    /// Upserts the group and replaces its member set.
    async fn save(&self, group: ApproverGroup) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &GroupId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Rule>, RepositoryError>;
    async fn list_for_subjects(
        &self,
        subjects: &[RuleSubject],
    ) -> Result<Vec<Rule>, RepositoryError>;
    async fn save(&self, rule: Rule) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait LineRepository: Send + Sync {
    async fn find_by_id(&self, id: &LineId) -> Result<Option<ApprovalLine>, RepositoryError>;
    /// Every line of `owner`, active or not, in display order.
    async fn list_for_owner(&self, owner: &UserId) -> Result<Vec<ApprovalLine>, RepositoryError>;
    /// Saves lines and their steps atomically.
    async fn save_all(&self, lines: Vec<ApprovalLine>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ApprovalRequestRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApprovalId)
        -> Result<Option<ApprovalRequest>, RepositoryError>;

    async fn find_by_approvable(
        &self,
        approvable: &ApprovableRef,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    async fn insert(&self, request: ApprovalRequest) -> Result<(), RepositoryError>;

    /// Writes the transitioned request and its history entry in one
    /// transaction, provided the stored version still equals `expected_version`.
    async fn commit_transition(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        history: &ApprovalHistoryEntry,
    ) -> Result<(), RepositoryError>;

    async fn append_history(&self, entry: &ApprovalHistoryEntry) -> Result<(), RepositoryError>;

    async fn history(&self, id: &ApprovalId) -> Result<Vec<ApprovalHistoryEntry>, RepositoryError>;

    /// Pending requests whose current step holds a pending approve row for `user`.
    async fn for_approver(&self, user: &UserId) -> Result<Vec<ApprovalRequest>, RepositoryError>;
}

pub(crate) fn decode_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_i32(column: &str, value: i64) -> Result<i32, RepositoryError> {
    i32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("invalid value for `{column}` (expected i32): {value}"))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_enum<T>(
    column: &str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(value).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{value}`")))
}
