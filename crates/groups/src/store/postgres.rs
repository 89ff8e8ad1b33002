use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::instrument;
use uuid::Uuid;

use mds_core::{Error, Group, GroupId, OperationId, Result, User, UserId};
use mds_infra::db::{is_unique_violation, map_sqlx_error};
use mds_infra::{PgDatabase, PgTx};

use super::GroupStore;

#[derive(Debug, FromRow)]
struct GroupRow {
    id: Uuid,
    title: String,
    description: String,
    operation: Option<Uuid>,
    members: Vec<Uuid>,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Self {
            id: GroupId::from_uuid(row.id),
            title: row.title,
            description: row.description,
            operation: row.operation.map(OperationId::from_uuid),
            members: row.members.into_iter().map(UserId::from_uuid).collect(),
        }
    }
}

fn member_uuids(group: &Group) -> Vec<Uuid> {
    group.members.iter().map(|m| *m.as_uuid()).collect()
}

#[async_trait]
impl GroupStore for PgDatabase {
    #[instrument(skip(self, tx, user), fields(user = %user.id), err)]
    async fn create_user(&self, tx: &mut PgTx, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, first_name, last_name, is_admin)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*user.id.as_uuid())
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_admin)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, user), fields(user = %user.id), err)]
    async fn update_user(&self, tx: &mut PgTx, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, first_name, last_name, is_admin)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                is_admin = EXCLUDED.is_admin
            "#,
        )
        .bind(*user.id.as_uuid())
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_admin)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_user", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn delete_user(&self, tx: &mut PgTx, id: UserId) -> Result<()> {
        sqlx::query(r#"DELETE FROM operation_members WHERE "user" = $1"#)
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user_memberships", e))?;
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;
        Ok(())
    }

    async fn unknown_users(&self, tx: &mut PgTx, users: &[UserId]) -> Result<Vec<UserId>> {
        let ids: Vec<Uuid> = users.iter().map(|u| *u.as_uuid()).collect();
        let known: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("unknown_users", e))?;
        let known: BTreeSet<Uuid> = known.into_iter().collect();
        Ok(users
            .iter()
            .filter(|u| !known.contains(u.as_uuid()))
            .copied()
            .collect())
    }

    #[instrument(skip(self, tx, members), fields(count = members.len()), err)]
    async fn update_operation_members(&self, tx: &mut PgTx, operation: OperationId, members: &[UserId]) -> Result<()> {
        sqlx::query("DELETE FROM operation_members WHERE operation = $1")
            .bind(*operation.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("clear_operation_members", e))?;

        let users: Vec<Uuid> = members.iter().map(|m| *m.as_uuid()).collect();
        sqlx::query(
            r#"
            INSERT INTO operation_members (operation, "user")
            SELECT $1, u FROM UNNEST($2::uuid[]) AS u
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(*operation.as_uuid())
        .bind(&users)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_operation_members", e))?;
        Ok(())
    }

    async fn operation_members(&self, tx: &mut PgTx, operation: OperationId) -> Result<BTreeSet<UserId>> {
        let rows: Vec<Uuid> = sqlx::query_scalar(r#"SELECT "user" FROM operation_members WHERE operation = $1"#)
            .bind(*operation.as_uuid())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("operation_members", e))?;
        Ok(rows.into_iter().map(UserId::from_uuid).collect())
    }

    #[instrument(skip(self, tx, group), fields(group = %group.id), err)]
    async fn create_group(&self, tx: &mut PgTx, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO groups (id, title, description, operation, members)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(*group.id.as_uuid())
        .bind(&group.title)
        .bind(&group.description)
        .bind(group.operation.map(|o| *o.as_uuid()))
        .bind(member_uuids(group))
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::bad_input(format!("group {} already exists", group.id))
            } else {
                map_sqlx_error("create_group", e)
            }
        })?;
        Ok(())
    }

    async fn group_by_id(&self, tx: &mut PgTx, id: GroupId) -> Result<Group> {
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, title, description, operation, members FROM groups WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("group_by_id", e))?;
        row.map(Into::into)
            .ok_or_else(|| Error::not_found(format!("group {id}")))
    }

    #[instrument(skip(self, tx, group), fields(group = %group.id), err)]
    async fn update_group(&self, tx: &mut PgTx, group: &Group) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE groups
            SET title = $2, description = $3, operation = $4, members = $5
            WHERE id = $1
            "#,
        )
        .bind(*group.id.as_uuid())
        .bind(&group.title)
        .bind(&group.description)
        .bind(group.operation.map(|o| *o.as_uuid()))
        .bind(member_uuids(group))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_group", e))?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("group {}", group.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn delete_group(&self, tx: &mut PgTx, id: GroupId) -> Result<()> {
        let done = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_group", e))?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("group {id}")));
        }
        Ok(())
    }

    async fn groups_by_member(&self, tx: &mut PgTx, user: UserId) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT id, title, description, operation, members
            FROM groups
            WHERE $1 = ANY(members)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(*user.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("groups_by_member", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn groups(&self, tx: &mut PgTx, offset: usize, limit: usize) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT id, title, description, operation, members
            FROM groups
            ORDER BY id
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("groups", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
