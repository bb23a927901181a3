use crate::condition::ApprovalContext;
use crate::domain::approval::ApprovableRef;
use crate::domain::group::UserId;
use crate::domain::rule::RuleSubject;

/// Capability set a business object exposes to be routed for approval.
///
/// The engine only ever sees these four views of the object; it never knows
/// the concrete type behind them.
pub trait Approvable {
    fn approvable_ref(&self) -> ApprovableRef;

    fn submitter(&self) -> UserId;

    /// Subjects whose rules apply, e.g. every expense code on a sheet.
    fn rule_subjects(&self) -> Vec<RuleSubject>;

    /// Flat snapshot of the fields rule conditions may reference.
    fn approval_context(&self) -> ApprovalContext;
}

/// Plain-data approvable for callers that already hold the snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovableSnapshot {
    pub reference: ApprovableRef,
    pub submitter: UserId,
    pub subjects: Vec<RuleSubject>,
    pub context: ApprovalContext,
}

impl ApprovableSnapshot {
    pub fn new(reference: ApprovableRef, submitter: impl Into<String>) -> Self {
        Self {
            reference,
            submitter: UserId(submitter.into()),
            subjects: Vec::new(),
            context: ApprovalContext::new(),
        }
    }

    pub fn with_subject(mut self, subject: RuleSubject) -> Self {
        if !self.subjects.contains(&subject) {
            self.subjects.push(subject);
        }
        self
    }

    pub fn with_context(mut self, context: ApprovalContext) -> Self {
        self.context = context;
        self
    }
}

impl Approvable for ApprovableSnapshot {
    fn approvable_ref(&self) -> ApprovableRef {
        self.reference.clone()
    }

    fn submitter(&self) -> UserId {
        self.submitter.clone()
    }

    fn rule_subjects(&self) -> Vec<RuleSubject> {
        self.subjects.clone()
    }

    fn approval_context(&self) -> ApprovalContext {
        self.context.clone()
    }
}
