use std::sync::Arc;

use expensa_core::approvable::ApprovableSnapshot;
use expensa_core::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
use expensa_core::condition::ApprovalContext;
use expensa_core::domain::approval::{ApprovableRef, ApprovalId, ApprovalStatus, HistoryAction};
use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};
use expensa_core::domain::line::{ApprovalLine, ApprovalLineStep, ApprovalType, LineId};
use expensa_core::domain::rule::{Rule, RuleSubject};
use expensa_core::hierarchy::InMemoryApproverResolver;
use expensa_core::workflow::{Actor, WorkflowError};
use expensa_db::{connect_with_settings, migrations, ApprovalService, Repositories, ServiceError};

fn audit(actor: &str) -> AuditContext {
    AuditContext::new(None, format!("corr-{actor}"), actor)
}

fn sheet() -> ApprovableSnapshot {
    ApprovableSnapshot::new(ApprovableRef::new("expense_sheet", "sheet-7"), "u-alice")
        .with_subject(RuleSubject::ExpenseCode("TRVL".to_string()))
        .with_context(ApprovalContext::new().with_number("amount", 42_000))
}

async fn sqlite_service() -> ApprovalService {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    ApprovalService::new(Repositories::sqlite(pool))
}

async fn seed(service: &ApprovalService) -> LineId {
    service
        .create_group(
            ApproverGroup::new("g-lead", "TeamLead", 5)
                .with_member("u-lead-1")
                .with_member("u-lead-2")
                .with_member("u-lead-3"),
        )
        .await
        .expect("lead group");
    service
        .create_group(ApproverGroup::new("g-head", "OrgHead", 8).with_member("u-head"))
        .await
        .expect("head group");
    service
        .add_rule(Rule::new(
            "r-travel",
            RuleSubject::ExpenseCode("TRVL".to_string()),
            "#amount >= 10000",
            GroupId("g-lead".to_string()),
            1,
        ))
        .await
        .expect("rule");

    let line = ["u-lead-1", "u-lead-2", "u-lead-3"]
        .iter()
        .enumerate()
        .fold(ApprovalLine::new("line-travel", "u-alice", "Travel"), |line, (index, user)| {
            line.with_step(
                ApprovalLineStep::approve(format!("lt-{index}"), 1, *user)
                    .with_approval_type(ApprovalType::AnyOne),
            )
            .expect("step")
        })
        .with_step(ApprovalLineStep::reference("lt-ref", 2, "u-fin"))
        .expect("step")
        .with_step(ApprovalLineStep::approve("lt-head", 3, "u-head"))
        .expect("step");
    service.save_line(line).await.expect("line").id
}

async fn submit(service: &ApprovalService, line_id: &LineId) -> ApprovalId {
    service
        .submit(&sheet(), Some(line_id), &audit("u-alice"))
        .await
        .expect("submit")
        .request()
        .expect("request created")
        .id
        .clone()
}

#[tokio::test]
async fn concurrent_any_one_approvals_advance_the_request_once() {
    let service = sqlite_service().await;
    let line_id = seed(&service).await;
    let request_id = submit(&service, &line_id).await;

    let first = Actor::user("u-lead-1");
    let second = Actor::user("u-lead-2");
    let first_audit = audit("u-lead-1");
    let second_audit = audit("u-lead-2");
    let (left, right) = tokio::join!(
        service.approve(&request_id, &first, None, &first_audit),
        service.approve(&request_id, &second, None, &second_audit),
    );

    let outcomes = [left, right];
    let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(outcomes.iter().any(|outcome| matches!(
        outcome,
        Err(ServiceError::Workflow(WorkflowError::UnauthorizedActor { .. }))
    )));

    let request = service.request(&request_id).await.expect("request");
    assert_eq!(request.current_step, 3);
    assert_eq!(request.version, 2);
    let history = service.history(&request_id).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Approve);
}

#[tokio::test]
async fn full_lifecycle_with_reset_on_sqlite() {
    let sink = InMemoryAuditSink::default();
    let service = sqlite_service().await.with_audit_sink(Arc::new(sink.clone()));
    let line_id = seed(&service).await;
    let request_id = submit(&service, &line_id).await;

    service.record_view(&request_id, &Actor::user("u-fin")).await.expect("view");
    service
        .approve(&request_id, &Actor::user("u-lead-3"), Some("ok".to_string()), &audit("u-lead-3"))
        .await
        .expect("lead approves");
    assert!(service.can_be_approved_by(&request_id, &UserId::new("u-head")).await.expect("check"));
    assert_eq!(service.for_approver(&UserId::new("u-head")).await.expect("inbox").len(), 1);

    let pending_reset = service
        .reset(&request_id, 1, &Actor::admin("u-admin"), "receipts changed", &audit("u-admin"))
        .await;
    assert!(matches!(
        pending_reset,
        Err(ServiceError::Workflow(WorkflowError::InvalidTransition { .. }))
    ));

    let done = service
        .approve(&request_id, &Actor::user("u-head"), None, &audit("u-head"))
        .await
        .expect("head approves");
    assert_eq!(done.request.status, ApprovalStatus::Approved);
    assert!(done.request.completed_at.is_some());

    let reopened = service
        .reset(&request_id, 1, &Actor::admin("u-admin"), "receipts changed", &audit("u-admin"))
        .await
        .expect("reset");
    assert_eq!(reopened.request.status, ApprovalStatus::Pending);
    assert_eq!(reopened.request.current_step, 1);
    assert!(service.can_be_approved_by(&request_id, &UserId::new("u-lead-3")).await.expect("check"));

    let actions: Vec<HistoryAction> = service
        .history(&request_id)
        .await
        .expect("history")
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(
        actions,
        vec![HistoryAction::View, HistoryAction::Approve, HistoryAction::Approve, HistoryAction::Reset]
    );

    let events = sink.events();
    assert!(events.iter().any(|event| {
        event.event_type == "workflow.reset.rejected" && event.outcome == AuditOutcome::Rejected
    }));
    assert!(events.iter().all(|event| event.correlation_id.starts_with("corr-")));
}

#[tokio::test]
async fn rejection_by_one_approver_closes_the_request() {
    let service = ApprovalService::new(Repositories::in_memory());
    let line_id = seed(&service).await;
    let request_id = submit(&service, &line_id).await;

    let rejected = service
        .reject(&request_id, &Actor::user("u-lead-2"), Some("no receipts".to_string()), &audit("u-lead-2"))
        .await
        .expect("reject");
    assert_eq!(rejected.request.status, ApprovalStatus::Rejected);

    let late = service.approve(&request_id, &Actor::user("u-lead-1"), None, &audit("u-lead-1")).await;
    assert!(matches!(late, Err(ServiceError::Workflow(WorkflowError::InvalidTransition { .. }))));
    assert!(service.for_approver(&UserId::new("u-lead-1")).await.expect("inbox").is_empty());

    let cancel = service.cancel(&request_id, &Actor::user("u-alice"), None, &audit("u-alice")).await;
    assert!(matches!(cancel, Err(ServiceError::Workflow(WorkflowError::InvalidTransition { .. }))));
}

#[tokio::test]
async fn stale_approvers_block_submission_and_are_reported_in_flight() {
    let repositories = Repositories::in_memory();
    let service = ApprovalService::new(repositories.clone());
    let line_id = seed(&service).await;
    let request_id = submit(&service, &line_id).await;

    let deactivated = ApprovalService::new(repositories).with_resolver(Arc::new(
        InMemoryApproverResolver::with_inactive_users(vec![UserId::new("u-lead-2")]),
    ));

    let blocked = deactivated.submit(&sheet(), Some(&line_id), &audit("u-alice")).await;
    match blocked {
        Err(ServiceError::Workflow(WorkflowError::StaleApprovalLine { approvers })) => {
            assert_eq!(approvers, vec![UserId::new("u-lead-2")]);
        }
        other => panic!("expected stale approval line, got {other:?}"),
    }

    let verified = deactivated.verify_current_step(&request_id).await;
    assert!(matches!(
        verified,
        Err(ServiceError::Workflow(WorkflowError::StaleApprovalLine { .. }))
    ));
    let request = deactivated.request(&request_id).await.expect("request");
    assert_eq!(request.status, ApprovalStatus::Pending);
    assert_eq!(
        deactivated
            .requests_for(&ApprovableRef::new("expense_sheet", "sheet-7"))
            .await
            .expect("requests")
            .len(),
        1
    );
}

#[tokio::test]
async fn unknown_request_is_not_found() {
    let service = ApprovalService::new(Repositories::in_memory());
    let missing = service
        .approve(&ApprovalId("nope".to_string()), &Actor::user("u-x"), None, &audit("u-x"))
        .await;
    assert!(matches!(missing, Err(ServiceError::NotFound { entity: "approval request", .. })));
}
