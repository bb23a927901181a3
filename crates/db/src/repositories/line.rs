use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::group::UserId;
use expensa_core::domain::line::{
    ApprovalLine, ApprovalLineStep, ApprovalType, LineId, StepId, StepRole,
};

use super::{decode_error, parse_enum, parse_timestamp, parse_u32, LineRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLineRepository {
    pool: DbPool,
}

impl SqlLineRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, line: &mut ApprovalLine) -> Result<(), RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, step_order, approver_id, role, approval_type
             FROM approval_line_steps
             WHERE line_id = ?
             ORDER BY position ASC",
        )
        .bind(&line.id.0)
        .fetch_all(&self.pool)
        .await?;

        line.steps = rows.iter().map(step_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LineRepository for SqlLineRepository {
    async fn find_by_id(&self, id: &LineId) -> Result<Option<ApprovalLine>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, active, display_order, created_at, updated_at
             FROM approval_lines WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut line = line_from_row(&row)?;
        self.load_steps(&mut line).await?;
        Ok(Some(line))
    }

    async fn list_for_owner(&self, owner: &UserId) -> Result<Vec<ApprovalLine>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, active, display_order, created_at, updated_at
             FROM approval_lines
             WHERE owner_id = ?
             ORDER BY display_order ASC, created_at ASC",
        )
        .bind(&owner.0)
        .fetch_all(&self.pool)
        .await?;

        let mut lines = rows.iter().map(line_from_row).collect::<Result<Vec<_>, _>>()?;
        for line in &mut lines {
            self.load_steps(line).await?;
        }
        Ok(lines)
    }

    async fn save_all(&self, lines: Vec<ApprovalLine>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        for line in &lines {
            sqlx::query(
                "INSERT INTO approval_lines (
                    id, owner_id, name, active, display_order, created_at, updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    active = excluded.active,
                    display_order = excluded.display_order,
                    updated_at = excluded.updated_at",
            )
            .bind(&line.id.0)
            .bind(&line.owner.0)
            .bind(&line.name)
            .bind(line.active)
            .bind(i64::from(line.display_order))
            .bind(line.created_at.to_rfc3339())
            .bind(line.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM approval_line_steps WHERE line_id = ?")
                .bind(&line.id.0)
                .execute(&mut *tx)
                .await?;

            for (position, step) in line.steps.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO approval_line_steps (
                        id, line_id, position, step_order, approver_id, role, approval_type
                     ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&step.id.0)
                .bind(&line.id.0)
                .bind(position as i64)
                .bind(i64::from(step.step_order))
                .bind(&step.approver.0)
                .bind(step.role.as_str())
                .bind(step.approval_type.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

fn line_from_row(row: &SqliteRow) -> Result<ApprovalLine, RepositoryError> {
    Ok(ApprovalLine {
        id: LineId(row.try_get("id").map_err(decode_error)?),
        owner: UserId(row.try_get("owner_id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        active: row.try_get("active").map_err(decode_error)?,
        display_order: parse_u32(
            "display_order",
            row.try_get("display_order").map_err(decode_error)?,
        )?,
        steps: Vec::new(),
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(decode_error)?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at").map_err(decode_error)?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<ApprovalLineStep, RepositoryError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    let approval_type: String = row.try_get("approval_type").map_err(decode_error)?;

    Ok(ApprovalLineStep {
        id: StepId(row.try_get("id").map_err(decode_error)?),
        step_order: parse_u32("step_order", row.try_get("step_order").map_err(decode_error)?)?,
        approver: UserId(row.try_get("approver_id").map_err(decode_error)?),
        role: parse_enum("step role", &role, StepRole::parse)?,
        approval_type: parse_enum("approval type", &approval_type, ApprovalType::parse)?,
    })
}
