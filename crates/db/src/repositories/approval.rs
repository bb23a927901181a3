use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use expensa_core::domain::approval::{
    ApprovableRef, ApprovalHistoryEntry, ApprovalId, ApprovalRequest, ApprovalRequestStep,
    ApprovalStatus, HistoryAction, HistoryId, StepStatus,
};
use expensa_core::domain::group::UserId;
use expensa_core::domain::line::{ApprovalType, LineId, StepRole};

use super::{
    decode_error, parse_enum, parse_optional_timestamp, parse_timestamp, parse_u32,
    ApprovalRequestRepository, RepositoryError,
};
use crate::DbPool;

const HISTORY_APPEND_ATTEMPTS: u32 = 3;

const REQUEST_COLUMNS: &str = "r.id, r.approvable_kind, r.approvable_id, r.approval_line_id,
    r.submitted_by, r.status, r.current_step, r.version, r.completed_at, r.created_at,
    r.updated_at";

pub struct SqlApprovalRequestRepository {
    pool: DbPool,
}

impl SqlApprovalRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_steps(
        &self,
        rows: Vec<SqliteRow>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut request = request_from_row(row)?;
            let steps = sqlx::query(
                "SELECT step_order, approver_id, role, approval_type, status, actioned_at
                 FROM approval_request_steps
                 WHERE request_id = ?
                 ORDER BY position ASC",
            )
            .bind(&request.id.0)
            .fetch_all(&self.pool)
            .await?;
            request.steps = steps.iter().map(step_from_row).collect::<Result<Vec<_>, _>>()?;
            requests.push(request);
        }
        Ok(requests)
    }
}

#[async_trait::async_trait]
impl ApprovalRequestRepository for SqlApprovalRequestRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_requests r WHERE r.id = ?"
        ))
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.with_steps(rows).await?.into_iter().next())
    }

    async fn find_by_approvable(
        &self,
        approvable: &ApprovableRef,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM approval_requests r
             WHERE r.approvable_kind = ? AND r.approvable_id = ?
             ORDER BY r.created_at DESC"
        ))
        .bind(&approvable.kind)
        .bind(&approvable.id)
        .fetch_all(&self.pool)
        .await?;

        self.with_steps(rows).await
    }

    async fn insert(&self, request: ApprovalRequest) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM approval_requests WHERE id = ?")
            .bind(&request.id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(RepositoryError::AlreadyExists {
                entity: "approval request",
                id: request.id.0.clone(),
            });
        }

        sqlx::query(
            "INSERT INTO approval_requests (
                id, approvable_kind, approvable_id, approval_line_id, submitted_by, status,
                current_step, version, completed_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&request.approvable.kind)
        .bind(&request.approvable.id)
        .bind(&request.approval_line_id.0)
        .bind(&request.submitted_by.0)
        .bind(request.status.as_str())
        .bind(i64::from(request.current_step))
        .bind(i64::from(request.version))
        .bind(request.completed_at.map(|value| value.to_rfc3339()))
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        write_steps(&mut tx, &request).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_transition(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        history: &ApprovalHistoryEntry,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_requests
             SET status = ?, current_step = ?, version = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(request.status.as_str())
        .bind(i64::from(request.current_step))
        .bind(i64::from(request.version))
        .bind(request.completed_at.map(|value| value.to_rfc3339()))
        .bind(request.updated_at.to_rfc3339())
        .bind(&request.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::VersionConflict {
                request_id: request.id.0.clone(),
                expected: expected_version,
            });
        }

        write_steps(&mut tx, request).await?;
        insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_history(&self, entry: &ApprovalHistoryEntry) -> Result<(), RepositoryError> {
        let mut attempt = 1;
        loop {
            let mut tx = self.pool.begin().await?;
            match insert_history(&mut tx, entry).await {
                Ok(()) => {
                    tx.commit().await?;
                    return Ok(());
                }
                Err(RepositoryError::Database(sqlx::Error::Database(error)))
                    if error.is_unique_violation() && attempt < HISTORY_APPEND_ATTEMPTS =>
                {
                    tx.rollback().await?;
                    tracing::warn!(
                        event_name = "db.history.seq_retry",
                        request_id = %entry.request_id,
                        attempt = attempt,
                        "history sequence collided, retrying append"
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn history(&self, id: &ApprovalId) -> Result<Vec<ApprovalHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, approver_id, step_order, role, action, comment, occurred_at
             FROM approval_histories
             WHERE request_id = ?
             ORDER BY seq ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    async fn for_approver(&self, user: &UserId) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {REQUEST_COLUMNS}
             FROM approval_requests r
             JOIN approval_request_steps s
               ON s.request_id = r.id AND s.step_order = r.current_step
             WHERE r.status = 'pending'
               AND s.approver_id = ?
               AND s.role = 'approve'
               AND s.status = 'pending'
             ORDER BY r.created_at ASC"
        ))
        .bind(&user.0)
        .fetch_all(&self.pool)
        .await?;

        self.with_steps(rows).await
    }
}

async fn write_steps(
    conn: &mut SqliteConnection,
    request: &ApprovalRequest,
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM approval_request_steps WHERE request_id = ?")
        .bind(&request.id.0)
        .execute(&mut *conn)
        .await?;

    for (position, step) in request.steps.iter().enumerate() {
        sqlx::query(
            "INSERT INTO approval_request_steps (
                request_id, position, step_order, approver_id, role, approval_type, status,
                actioned_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(position as i64)
        .bind(i64::from(step.step_order))
        .bind(&step.approver.0)
        .bind(step.role.as_str())
        .bind(step.approval_type.as_str())
        .bind(step.status.as_str())
        .bind(step.actioned_at.map(|value| value.to_rfc3339()))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// History rows are only ever inserted.
async fn insert_history(
    conn: &mut SqliteConnection,
    entry: &ApprovalHistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO approval_histories (
            id, request_id, seq, approver_id, step_order, role, action, comment, occurred_at
         ) VALUES (
            ?, ?,
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM approval_histories WHERE request_id = ?),
            ?, ?, ?, ?, ?, ?
         )",
    )
    .bind(&entry.id.0)
    .bind(&entry.request_id.0)
    .bind(&entry.request_id.0)
    .bind(&entry.approver.0)
    .bind(i64::from(entry.step_order))
    .bind(entry.role.map(|role| role.as_str()))
    .bind(entry.action.as_str())
    .bind(entry.comment.as_deref())
    .bind(entry.occurred_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn request_from_row(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;

    Ok(ApprovalRequest {
        id: ApprovalId(row.try_get("id").map_err(decode_error)?),
        approvable: ApprovableRef {
            kind: row.try_get("approvable_kind").map_err(decode_error)?,
            id: row.try_get("approvable_id").map_err(decode_error)?,
        },
        approval_line_id: LineId(row.try_get("approval_line_id").map_err(decode_error)?),
        submitted_by: UserId(row.try_get("submitted_by").map_err(decode_error)?),
        status: parse_enum("request status", &status, ApprovalStatus::parse)?,
        current_step: parse_u32("current_step", row.try_get("current_step").map_err(decode_error)?)?,
        steps: Vec::new(),
        version: parse_u32("version", row.try_get("version").map_err(decode_error)?)?,
        completed_at: parse_optional_timestamp(
            "completed_at",
            row.try_get("completed_at").map_err(decode_error)?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(decode_error)?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at").map_err(decode_error)?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<ApprovalRequestStep, RepositoryError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    let approval_type: String = row.try_get("approval_type").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;

    Ok(ApprovalRequestStep {
        approver: UserId(row.try_get("approver_id").map_err(decode_error)?),
        step_order: parse_u32("step_order", row.try_get("step_order").map_err(decode_error)?)?,
        role: parse_enum("step role", &role, StepRole::parse)?,
        approval_type: parse_enum("approval type", &approval_type, ApprovalType::parse)?,
        status: parse_enum("step status", &status, StepStatus::parse)?,
        actioned_at: parse_optional_timestamp(
            "actioned_at",
            row.try_get("actioned_at").map_err(decode_error)?,
        )?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<ApprovalHistoryEntry, RepositoryError> {
    let role: Option<String> = row.try_get("role").map_err(decode_error)?;
    let action: String = row.try_get("action").map_err(decode_error)?;

    Ok(ApprovalHistoryEntry {
        id: HistoryId(row.try_get("id").map_err(decode_error)?),
        request_id: ApprovalId(row.try_get("request_id").map_err(decode_error)?),
        approver: UserId(row.try_get("approver_id").map_err(decode_error)?),
        step_order: parse_u32("step_order", row.try_get("step_order").map_err(decode_error)?)?,
        role: role.map(|value| parse_enum("history role", &value, StepRole::parse)).transpose()?,
        action: parse_enum("history action", &action, HistoryAction::parse)?,
        comment: row.try_get("comment").map_err(decode_error)?,
        occurred_at: parse_timestamp(
            "occurred_at",
            row.try_get("occurred_at").map_err(decode_error)?,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use expensa_core::approvable::ApprovableSnapshot;
    use expensa_core::condition::ApprovalContext;
    use expensa_core::domain::approval::{ApprovableRef, ApprovalRequest, ApprovalStatus, HistoryAction};
    use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};
    use expensa_core::domain::line::{ApprovalLine, ApprovalLineStep, ApprovalType};
    use expensa_core::domain::rule::{Rule, RuleSubject};
    use expensa_core::hierarchy::{GroupDirectory, InMemoryApproverResolver};
    use expensa_core::rules::RuleSet;
    use expensa_core::workflow::{Actor, ApprovalWorkflow, PolicySnapshot, Submission};

    use super::SqlApprovalRequestRepository;
    use crate::repositories::{
        ApprovalRequestRepository, LineRepository, RepositoryError, SqlLineRepository,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn line() -> ApprovalLine {
        ApprovalLine::new("line-1", "u-alice", "Leads")
            .with_step(
                ApprovalLineStep::approve("s-1", 1, "u-lead").with_approval_type(ApprovalType::AnyOne),
            )
            .expect("step")
            .with_step(
                ApprovalLineStep::approve("s-2", 1, "u-lead-2").with_approval_type(ApprovalType::AnyOne),
            )
            .expect("step")
            .with_step(ApprovalLineStep::reference("s-3", 2, "u-fin"))
            .expect("step")
            .with_step(ApprovalLineStep::approve("s-4", 3, "u-head"))
            .expect("step")
    }

    async fn submitted(pool: &DbPool) -> ApprovalRequest {
        let line = line();
        SqlLineRepository::new(pool.clone()).save_all(vec![line.clone()]).await.expect("line");

        let directory = GroupDirectory::new(vec![
            ApproverGroup::new("g-lead", "TeamLead", 5).with_member("u-lead").with_member("u-lead-2"),
        ])
        .expect("directory");
        let mut rules = RuleSet::default();
        rules
            .add_rule(Rule::new(
                "r-1",
                RuleSubject::ExpenseCode("TRVL".to_string()),
                "",
                GroupId("g-lead".to_string()),
                1,
            ))
            .expect("rule");
        let resolver = InMemoryApproverResolver::default();
        let sheet = ApprovableSnapshot::new(ApprovableRef::new("expense_sheet", "sheet-1"), "u-alice")
            .with_subject(RuleSubject::ExpenseCode("TRVL".to_string()))
            .with_context(ApprovalContext::new().with_number("amount", 1_000));

        match ApprovalWorkflow::new()
            .submit(&PolicySnapshot::new(&rules, &directory, &resolver), &sheet, Some(&line))
            .expect("submit")
        {
            Submission::Submitted { request, .. } => request,
            Submission::NotRequired { .. } => panic!("approval should be required"),
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trips_request_with_steps() {
        let pool = setup().await;
        let request = submitted(&pool).await;
        let repo = SqlApprovalRequestRepository::new(pool);

        repo.insert(request.clone()).await.expect("insert");
        let found = repo.find_by_id(&request.id).await.expect("find").expect("exists");

        assert_eq!(found.steps, request.steps);
        assert_eq!(found.version, 1);
        assert_eq!(found.status, ApprovalStatus::Pending);

        let duplicate = repo.insert(request).await;
        assert!(matches!(duplicate, Err(RepositoryError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn stale_version_commit_is_rejected_and_rolled_back() {
        let pool = setup().await;
        let request = submitted(&pool).await;
        let repo = SqlApprovalRequestRepository::new(pool);
        repo.insert(request.clone()).await.expect("insert");

        let workflow = ApprovalWorkflow::new();
        let first = workflow.approve(request.clone(), &Actor::user("u-lead"), None).expect("first");
        let second =
            workflow.approve(request.clone(), &Actor::user("u-lead-2"), None).expect("second");

        repo.commit_transition(&first.request, request.version, &first.history)
            .await
            .expect("winner commits");
        let loser = repo.commit_transition(&second.request, request.version, &second.history).await;
        assert!(matches!(loser, Err(RepositoryError::VersionConflict { expected: 1, .. })));

        let stored = repo.find_by_id(&request.id).await.expect("find").expect("exists");
        assert_eq!(stored.current_step, 3);
        assert_eq!(stored.version, 2);
        let history = repo.history(&request.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].approver, UserId::new("u-lead"));
    }

    #[tokio::test]
    async fn for_approver_only_matches_the_current_step() {
        let pool = setup().await;
        let request = submitted(&pool).await;
        let repo = SqlApprovalRequestRepository::new(pool);
        repo.insert(request.clone()).await.expect("insert");

        assert_eq!(repo.for_approver(&UserId::new("u-lead-2")).await.expect("query").len(), 1);
        assert!(repo.for_approver(&UserId::new("u-head")).await.expect("query").is_empty());
        assert!(repo.for_approver(&UserId::new("u-fin")).await.expect("query").is_empty());

        let advanced =
            ApprovalWorkflow::new().approve(request, &Actor::user("u-lead"), None).expect("approve");
        repo.commit_transition(&advanced.request, 1, &advanced.history).await.expect("commit");

        assert!(repo.for_approver(&UserId::new("u-lead-2")).await.expect("query").is_empty());
        assert_eq!(repo.for_approver(&UserId::new("u-head")).await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn history_lists_entries_in_insertion_order() {
        let pool = setup().await;
        let request = submitted(&pool).await;
        let repo = SqlApprovalRequestRepository::new(pool);
        repo.insert(request.clone()).await.expect("insert");
        let workflow = ApprovalWorkflow::new();

        let view = workflow.record_view(&request, &Actor::user("u-fin")).expect("view");
        repo.append_history(&view).await.expect("append view");
        let approved = workflow.approve(request, &Actor::user("u-lead"), Some("ok".to_string())).expect("approve");
        repo.commit_transition(&approved.request, 1, &approved.history).await.expect("commit");

        let history = repo.history(&approved.request.id).await.expect("history");
        let actions: Vec<HistoryAction> = history.iter().map(|entry| entry.action).collect();
        assert_eq!(actions, vec![HistoryAction::View, HistoryAction::Approve]);
        assert_eq!(history[1].comment.as_deref(), Some("ok"));
        assert_eq!(history[0].role, Some(expensa_core::domain::line::StepRole::Reference));

        let by_ref = repo
            .find_by_approvable(&ApprovableRef::new("expense_sheet", "sheet-1"))
            .await
            .expect("by approvable");
        assert_eq!(by_ref.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_views_and_transition_get_distinct_sequence_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("history.db").display());
        let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let request = submitted(&pool).await;
        let repo = SqlApprovalRequestRepository::new(pool.clone());
        repo.insert(request.clone()).await.expect("insert");

        let workflow = ApprovalWorkflow::new();
        let views: Vec<_> = (0..4)
            .map(|_| workflow.record_view(&request, &Actor::user("u-fin")).expect("view"))
            .collect();
        let approved =
            workflow.approve(request.clone(), &Actor::user("u-lead"), None).expect("approve");

        let (first, second, third, fourth, transition) = tokio::join!(
            repo.append_history(&views[0]),
            repo.append_history(&views[1]),
            repo.append_history(&views[2]),
            repo.append_history(&views[3]),
            repo.commit_transition(&approved.request, 1, &approved.history),
        );
        for outcome in [first, second, third, fourth, transition] {
            outcome.expect("every write lands");
        }

        let seqs: Vec<i64> = sqlx::query_scalar(
            "SELECT seq FROM approval_histories WHERE request_id = ? ORDER BY seq ASC",
        )
        .bind(&request.id.0)
        .fetch_all(&pool)
        .await
        .expect("seqs");
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(repo.history(&request.id).await.expect("history").len(), 5);
    }
}
