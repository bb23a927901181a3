pub mod engine;
pub mod states;

pub use engine::{ApprovalWorkflow, PolicySnapshot};
pub use states::{Actor, Submission, TransitionResult, WorkflowAction, WorkflowError};
