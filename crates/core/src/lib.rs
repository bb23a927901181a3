pub mod approvable;
pub mod approvals;
pub mod audit;
pub mod condition;
pub mod config;
pub mod domain;
pub mod errors;
pub mod hierarchy;
pub mod lines;
pub mod rules;
pub mod workflow;

pub use approvable::{Approvable, ApprovableSnapshot};
pub use approvals::{LineValidationInput, LineValidationResult, LineValidator, ValidationFinding};
pub use condition::{evaluate, ApprovalContext, Condition, ConditionParseError, ContextValue};
pub use domain::approval::{
    ApprovableRef, ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalRequestStep,
    ApprovalStatus, HistoryAction, StepStatus,
};
pub use domain::group::{ApproverGroup, GroupId, UserId};
pub use domain::line::{ApprovalLine, ApprovalLineStep, ApprovalType, LineError, LineId, StepRole};
pub use domain::rule::{Rule, RuleId, RuleSubject};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use hierarchy::{ApproverResolver, DirectoryError, GroupDirectory, InMemoryApproverResolver};
pub use lines::ApprovalLineBook;
pub use rules::{RequiredGroups, RuleSet, RuleSetError, UnparsableConditionPolicy};
pub use workflow::{
    Actor, ApprovalWorkflow, PolicySnapshot, Submission, TransitionResult, WorkflowAction,
    WorkflowError,
};
