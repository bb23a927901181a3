use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::group::GroupId;
use expensa_core::domain::rule::{Rule, RuleId, RuleSubject};

use super::{decode_error, parse_i32, RepositoryError, RuleRepository};
use crate::DbPool;

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn list(&self) -> Result<Vec<Rule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, subject_kind, subject_key, condition, group_id, rule_order, active
             FROM approval_rules
             ORDER BY subject_kind, subject_key, rule_order, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn list_for_subjects(
        &self,
        subjects: &[RuleSubject],
    ) -> Result<Vec<Rule>, RepositoryError> {
        let mut rules = Vec::new();
        for subject in subjects {
            let rows = sqlx::query(
                "SELECT id, subject_kind, subject_key, condition, group_id, rule_order, active
                 FROM approval_rules
                 WHERE subject_kind = ? AND subject_key = ?
                 ORDER BY rule_order, id",
            )
            .bind(subject.kind())
            .bind(subject.key())
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                let rule = rule_from_row(row)?;
                if !rules.iter().any(|existing: &Rule| existing.id == rule.id) {
                    rules.push(rule);
                }
            }
        }
        Ok(rules)
    }

    async fn save(&self, rule: Rule) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO approval_rules (
                id, subject_kind, subject_key, condition, group_id, rule_order, active,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                subject_kind = excluded.subject_kind,
                subject_key = excluded.subject_key,
                condition = excluded.condition,
                group_id = excluded.group_id,
                rule_order = excluded.rule_order,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(rule.subject.kind())
        .bind(rule.subject.key())
        .bind(&rule.condition)
        .bind(&rule.group_id.0)
        .bind(i64::from(rule.order))
        .bind(rule.active)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM approval_rules WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule, RepositoryError> {
    let kind: String = row.try_get("subject_kind").map_err(decode_error)?;
    let key: String = row.try_get("subject_key").map_err(decode_error)?;
    let subject = RuleSubject::parse(&kind, &key)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown rule subject kind `{kind}`")))?;

    Ok(Rule {
        id: RuleId(row.try_get("id").map_err(decode_error)?),
        subject,
        condition: row.try_get("condition").map_err(decode_error)?,
        group_id: GroupId(row.try_get("group_id").map_err(decode_error)?),
        order: parse_i32("rule_order", row.try_get("rule_order").map_err(decode_error)?)?,
        active: row.try_get("active").map_err(decode_error)?,
    })
}
