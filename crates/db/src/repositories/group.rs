use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};

use super::{decode_error, parse_i32, GroupRepository, RepositoryError};
use crate::DbPool;

pub struct SqlGroupRepository {
    pool: DbPool,
}

impl SqlGroupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn members_of(&self, group_ids: &[String]) -> Result<HashMap<String, BTreeSet<UserId>>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT group_id, user_id FROM approver_group_members ORDER BY group_id, user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut members: HashMap<String, BTreeSet<UserId>> = HashMap::new();
        for row in rows {
            let group_id: String = row.try_get("group_id").map_err(decode_error)?;
            if !group_ids.contains(&group_id) {
                continue;
            }
            let user_id: String = row.try_get("user_id").map_err(decode_error)?;
            members.entry(group_id).or_default().insert(UserId(user_id));
        }
        Ok(members)
    }
}

#[async_trait::async_trait]
impl GroupRepository for SqlGroupRepository {
    async fn list(&self) -> Result<Vec<ApproverGroup>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, priority, active
             FROM approver_groups
             ORDER BY priority DESC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut groups = rows.iter().map(group_from_row).collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = groups.iter().map(|group| group.id.0.clone()).collect();
        let mut members = self.members_of(&ids).await?;
        for group in &mut groups {
            group.members = members.remove(&group.id.0).unwrap_or_default();
        }
        Ok(groups)
    }

    async fn find_by_id(&self, id: &GroupId) -> Result<Option<ApproverGroup>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, priority, active FROM approver_groups WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut group = group_from_row(&row)?;
        group.members =
            self.members_of(std::slice::from_ref(&id.0)).await?.remove(&id.0).unwrap_or_default();
        Ok(Some(group))
    }

    async fn save(&self, group: ApproverGroup) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approver_groups (id, name, priority, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 priority = excluded.priority,
                 active = excluded.active,
                 updated_at = excluded.updated_at",
        )
        .bind(&group.id.0)
        .bind(&group.name)
        .bind(i64::from(group.priority))
        .bind(group.active)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM approver_group_members WHERE group_id = ?")
            .bind(&group.id.0)
            .execute(&mut *tx)
            .await?;

        for member in &group.members {
            sqlx::query("INSERT INTO approver_group_members (group_id, user_id) VALUES (?, ?)")
                .bind(&group.id.0)
                .bind(&member.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: &GroupId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM approver_groups WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn group_from_row(row: &SqliteRow) -> Result<ApproverGroup, RepositoryError> {
    Ok(ApproverGroup {
        id: GroupId(row.try_get("id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        priority: parse_i32("priority", row.try_get("priority").map_err(decode_error)?)?,
        active: row.try_get("active").map_err(decode_error)?,
        members: BTreeSet::new(),
    })
}

#[cfg(test)]
mod tests {
    use expensa_core::domain::group::{ApproverGroup, GroupId, UserId};

    use super::SqlGroupRepository;
    use crate::repositories::GroupRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn save_and_list_orders_by_priority_with_members() {
        let repo = SqlGroupRepository::new(setup().await);
        repo.save(ApproverGroup::new("g-lead", "TeamLead", 5).with_member("u-lead"))
            .await
            .expect("save lead");
        repo.save(
            ApproverGroup::new("g-ceo", "CEO", 10).with_member("u-ceo").with_member("u-dual"),
        )
        .await
        .expect("save ceo");

        let groups = repo.list().await.expect("list");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "CEO");
        assert!(groups[0].is_member(&UserId::new("u-dual")));
        assert!(groups[1].is_member(&UserId::new("u-lead")));
    }

    #[tokio::test]
    async fn save_replaces_member_set() {
        let repo = SqlGroupRepository::new(setup().await);
        let group = ApproverGroup::new("g-head", "OrgHead", 8).with_member("u-old");
        repo.save(group.clone()).await.expect("save");

        let mut updated = group;
        updated.members.clear();
        updated.members.insert(UserId::new("u-new"));
        updated.active = false;
        repo.save(updated).await.expect("upsert");

        let found = repo
            .find_by_id(&GroupId("g-head".to_string()))
            .await
            .expect("find")
            .expect("group exists");
        assert!(!found.active);
        assert!(found.is_member(&UserId::new("u-new")));
        assert!(!found.is_member(&UserId::new("u-old")));
    }

    #[tokio::test]
    async fn group_names_are_unique_ignoring_case() {
        let repo = SqlGroupRepository::new(setup().await);
        repo.save(ApproverGroup::new("g-1", "Finance", 6)).await.expect("save");

        let duplicate = repo.save(ApproverGroup::new("g-2", "FINANCE", 7)).await;
        assert!(duplicate.is_err());
    }
}
