use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::context::{AdminCapability, QuotaContext};
use crate::error::QuotaError;
use crate::ledger::UsageLedger;
use crate::model::{QuotaMap, QuotaUsage, Reservation, UserQuota};
use crate::store::{QuotaStore, RefreshRequest, ReserveRequest, UsageScope};

fn storage(e: sqlx::Error) -> QuotaError {
    QuotaError::Storage(e.to_string())
}

/// PostgreSQL-backed quota store.
///
/// Every mutation of a project's usage rows takes a transaction-scoped
/// advisory lock keyed on the project id, so reservations for one project
/// are serialized while other projects proceed in parallel.
#[derive(Clone)]
pub struct PostgresQuotaStore {
    pool: PgPool,
}

impl PostgresQuotaStore {
    /// Create a new store from a database URL.
    pub async fn new(database_url: &str) -> Result<Self, QuotaError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage)?;
        Ok(Self { pool })
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, QuotaError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(storage)?;
        Ok(Self { pool })
    }

    /// Create a new store with a custom connection pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the quota tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), QuotaError> {
        sqlx::raw_sql(CREATE_QUOTA_TABLES)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn lock_project(
        tx: &mut Transaction<'_, Postgres>,
        project_id: &str,
    ) -> Result<(), QuotaError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(project_id)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn load_usages(
        tx: &mut Transaction<'_, Postgres>,
        project_id: &str,
    ) -> Result<Vec<QuotaUsage>, QuotaError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, user_id, resource, in_use, reserved, until_refresh, created_at, updated_at
            FROM quota_usages
            WHERE project_id = $1
            FOR UPDATE
            "#,
        )
        .bind(project_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(storage)?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn save_usages(
        tx: &mut Transaction<'_, Postgres>,
        ledger: &UsageLedger,
    ) -> Result<(), QuotaError> {
        for usage in ledger.touched_rows() {
            sqlx::query(
                r#"
                INSERT INTO quota_usages (id, project_id, user_id, resource, in_use, reserved, until_refresh, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE
                SET in_use = EXCLUDED.in_use,
                    reserved = EXCLUDED.reserved,
                    until_refresh = EXCLUDED.until_refresh,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(usage.id)
            .bind(&usage.project_id)
            .bind(&usage.user_id)
            .bind(&usage.resource)
            .bind(usage.in_use)
            .bind(usage.reserved)
            .bind(usage.until_refresh)
            .bind(usage.created_at)
            .bind(usage.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;
        }
        Ok(())
    }

    /// Deletes the reservations and folds their deltas back into usage rows.
    async fn settle(&self, ids: &[Uuid], commit: bool) -> Result<usize, QuotaError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let projects: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT project_id FROM reservations WHERE id = ANY($1) ORDER BY project_id",
        )
        .bind(ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        for project_id in &projects {
            Self::lock_project(&mut tx, project_id).await?;
        }

        let settled = sqlx::query("DELETE FROM reservations WHERE id = ANY($1) RETURNING usage_id, delta")
            .bind(ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let count = settled.len();
        if count < ids.len() {
            tracing::warn!(
                requested = ids.len(),
                found = count,
                "some reservations were already resolved"
            );
        }

        let mut deltas: BTreeMap<Uuid, i64> = BTreeMap::new();
        for row in &settled {
            let usage_id: Uuid = row.try_get("usage_id").map_err(storage)?;
            let delta: i64 = row.try_get("delta").map_err(storage)?;
            *deltas.entry(usage_id).or_default() += delta;
        }
        let statement = if commit {
            "UPDATE quota_usages SET in_use = in_use + $2, reserved = reserved - $2 WHERE id = $1"
        } else {
            "UPDATE quota_usages SET reserved = reserved - $2 WHERE id = $1"
        };
        for (usage_id, delta) in deltas {
            sqlx::query(statement)
                .bind(usage_id)
                .bind(delta)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(count)
    }

    async fn quota_map(&self, sql: &str, binds: &[&str]) -> Result<QuotaMap, QuotaError> {
        let mut query = sqlx::query::<Postgres>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter()
            .map(|row| {
                let resource: String = row.try_get("resource").map_err(storage)?;
                let hard_limit: i64 = row.try_get("hard_limit").map_err(storage)?;
                Ok((resource, hard_limit))
            })
            .collect()
    }

    async fn single_limit(&self, sql: &str, binds: &[&str]) -> Result<Option<i64>, QuotaError> {
        let mut query = sqlx::query_scalar::<Postgres, i64>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        query.fetch_optional(&self.pool).await.map_err(storage)
    }
}

fn usage_from_row(row: &PgRow) -> Result<QuotaUsage, QuotaError> {
    Ok(QuotaUsage {
        id: row.try_get("id").map_err(storage)?,
        project_id: row.try_get("project_id").map_err(storage)?,
        user_id: row.try_get("user_id").map_err(storage)?,
        resource: row.try_get("resource").map_err(storage)?,
        in_use: row.try_get("in_use").map_err(storage)?,
        reserved: row.try_get("reserved").map_err(storage)?,
        until_refresh: row.try_get("until_refresh").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

const CREATE_QUOTA_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS quota_classes (
    class_name TEXT NOT NULL,
    resource TEXT NOT NULL,
    hard_limit BIGINT NOT NULL,
    PRIMARY KEY (class_name, resource)
);
CREATE TABLE IF NOT EXISTS quotas (
    project_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    hard_limit BIGINT NOT NULL,
    PRIMARY KEY (project_id, resource)
);
CREATE TABLE IF NOT EXISTS project_user_quotas (
    project_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    hard_limit BIGINT NOT NULL,
    PRIMARY KEY (project_id, user_id, resource)
);
CREATE TABLE IF NOT EXISTS quota_usages (
    id UUID PRIMARY KEY,
    project_id TEXT NOT NULL,
    user_id TEXT,
    resource TEXT NOT NULL,
    in_use BIGINT NOT NULL,
    reserved BIGINT NOT NULL,
    until_refresh BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_quota_usages_scope
    ON quota_usages (project_id, COALESCE(user_id, ''), resource);
CREATE TABLE IF NOT EXISTS reservations (
    id UUID PRIMARY KEY,
    usage_id UUID NOT NULL REFERENCES quota_usages (id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    user_id TEXT,
    resource TEXT NOT NULL,
    delta BIGINT NOT NULL,
    expire TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_reservations_expire ON reservations (expire);
"#;

#[async_trait]
impl QuotaStore for PostgresQuotaStore {
    async fn get_project_quota(
        &self,
        project_id: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError> {
        self.single_limit(
            "SELECT hard_limit FROM quotas WHERE project_id = $1 AND resource = $2",
            &[project_id, resource],
        )
        .await
    }

    async fn get_user_quota(
        &self,
        project_id: &str,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError> {
        self.single_limit(
            "SELECT hard_limit FROM project_user_quotas WHERE project_id = $1 AND user_id = $2 AND resource = $3",
            &[project_id, user_id, resource],
        )
        .await
    }

    async fn get_class_quota(
        &self,
        class_name: &str,
        resource: &str,
    ) -> Result<Option<i64>, QuotaError> {
        self.single_limit(
            "SELECT hard_limit FROM quota_classes WHERE class_name = $1 AND resource = $2",
            &[class_name, resource],
        )
        .await
    }

    async fn get_all_by_project(&self, project_id: &str) -> Result<QuotaMap, QuotaError> {
        self.quota_map(
            "SELECT resource, hard_limit FROM quotas WHERE project_id = $1",
            &[project_id],
        )
        .await
    }

    async fn get_all_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<QuotaMap, QuotaError> {
        self.quota_map(
            "SELECT resource, hard_limit FROM project_user_quotas WHERE project_id = $1 AND user_id = $2",
            &[project_id, user_id],
        )
        .await
    }

    async fn get_all_by_class(&self, class_name: &str) -> Result<QuotaMap, QuotaError> {
        self.quota_map(
            "SELECT resource, hard_limit FROM quota_classes WHERE class_name = $1",
            &[class_name],
        )
        .await
    }

    async fn get_all_user_quotas(&self, project_id: &str) -> Result<Vec<UserQuota>, QuotaError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, resource, hard_limit
            FROM project_user_quotas
            WHERE project_id = $1
            ORDER BY user_id, resource
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter()
            .map(|row| {
                Ok(UserQuota {
                    user_id: row.try_get("user_id").map_err(storage)?,
                    resource: row.try_get("resource").map_err(storage)?,
                    hard_limit: row.try_get("hard_limit").map_err(storage)?,
                })
            })
            .collect()
    }

    async fn set_project_quota(
        &self,
        project_id: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO quotas (project_id, resource, hard_limit) VALUES ($1, $2, $3)
            ON CONFLICT (project_id, resource) DO UPDATE SET hard_limit = EXCLUDED.hard_limit
            "#,
        )
        .bind(project_id)
        .bind(resource)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn set_user_quota(
        &self,
        project_id: &str,
        user_id: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO project_user_quotas (project_id, user_id, resource, hard_limit) VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id, user_id, resource) DO UPDATE SET hard_limit = EXCLUDED.hard_limit
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .bind(resource)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn set_class_quota(
        &self,
        class_name: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO quota_classes (class_name, resource, hard_limit) VALUES ($1, $2, $3)
            ON CONFLICT (class_name, resource) DO UPDATE SET hard_limit = EXCLUDED.hard_limit
            "#,
        )
        .bind(class_name)
        .bind(resource)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_usage(
        &self,
        scope: &UsageScope,
        resource: &str,
    ) -> Result<Option<QuotaUsage>, QuotaError> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, user_id, resource, in_use, reserved, until_refresh, created_at, updated_at
            FROM quota_usages
            WHERE project_id = $1 AND user_id IS NOT DISTINCT FROM $2 AND resource = $3
            "#,
        )
        .bind(&scope.project_id)
        .bind(&scope.user_id)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(usage_from_row).transpose()
    }

    async fn get_usages_by_project(&self, project_id: &str) -> Result<Vec<QuotaUsage>, QuotaError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, user_id, resource, in_use, reserved, until_refresh, created_at, updated_at
            FROM quota_usages
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn get_usages_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Vec<QuotaUsage>, QuotaError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, user_id, resource, in_use, reserved, until_refresh, created_at, updated_at
            FROM quota_usages
            WHERE project_id = $1 AND (user_id = $2 OR user_id IS NULL)
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn reset_usage(
        &self,
        _admin: &AdminCapability,
        scope: &UsageScope,
        resource: &str,
    ) -> Result<bool, QuotaError> {
        let result = sqlx::query(
            r#"
            UPDATE quota_usages SET in_use = -1
            WHERE project_id = $1 AND user_id IS NOT DISTINCT FROM $2 AND resource = $3
            "#,
        )
        .bind(&scope.project_id)
        .bind(&scope.user_id)
        .bind(resource)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reserve(
        &self,
        ctx: &QuotaContext,
        request: ReserveRequest,
    ) -> Result<Vec<Reservation>, QuotaError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::lock_project(&mut tx, &request.project_id).await?;
        let rows = Self::load_usages(&mut tx, &request.project_id).await?;

        let mut ledger = UsageLedger::new(request.project_id.clone(), rows);
        // Dropping `tx` on error rolls the transaction back.
        let reservations = ledger.reserve(ctx, &request).await?;
        Self::save_usages(&mut tx, &ledger).await?;

        for reservation in &reservations {
            sqlx::query(
                r#"
                INSERT INTO reservations (id, usage_id, project_id, user_id, resource, delta, expire, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(reservation.id)
            .bind(reservation.usage_id)
            .bind(&reservation.project_id)
            .bind(&reservation.user_id)
            .bind(&reservation.resource)
            .bind(reservation.delta)
            .bind(reservation.expire)
            .bind(reservation.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(reservations)
    }

    async fn commit(&self, reservations: &[Reservation]) -> Result<usize, QuotaError> {
        let ids: Vec<Uuid> = reservations.iter().map(|r| r.id).collect();
        self.settle(&ids, true).await
    }

    async fn rollback(&self, reservations: &[Reservation]) -> Result<usize, QuotaError> {
        let ids: Vec<Uuid> = reservations.iter().map(|r| r.id).collect();
        self.settle(&ids, false).await
    }

    async fn refresh_usage(
        &self,
        ctx: &QuotaContext,
        request: RefreshRequest,
    ) -> Result<(), QuotaError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::lock_project(&mut tx, &request.project_id).await?;
        let rows = Self::load_usages(&mut tx, &request.project_id).await?;

        let mut ledger = UsageLedger::new(request.project_id.clone(), rows);
        ledger.refresh(ctx, &request).await?;
        Self::save_usages(&mut tx, &ledger).await?;

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<usize, QuotaError> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM reservations WHERE expire < $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        self.settle(&ids, false).await
    }

    async fn destroy_all_by_project(&self, project_id: &str) -> Result<(), QuotaError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::lock_project(&mut tx, project_id).await?;
        for statement in [
            "DELETE FROM reservations WHERE project_id = $1",
            "DELETE FROM quota_usages WHERE project_id = $1",
            "DELETE FROM project_user_quotas WHERE project_id = $1",
            "DELETE FROM quotas WHERE project_id = $1",
        ] {
            sqlx::query(statement)
                .bind(project_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn destroy_all_by_project_and_user(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), QuotaError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::lock_project(&mut tx, project_id).await?;

        // Reservations on shared project rows are released before the user's rows go.
        let released = sqlx::query(
            "DELETE FROM reservations WHERE project_id = $1 AND user_id = $2 RETURNING usage_id, delta",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        let mut deltas: BTreeMap<Uuid, i64> = BTreeMap::new();
        for row in &released {
            let usage_id: Uuid = row.try_get("usage_id").map_err(storage)?;
            let delta: i64 = row.try_get("delta").map_err(storage)?;
            *deltas.entry(usage_id).or_default() += delta;
        }
        for (usage_id, delta) in deltas {
            sqlx::query("UPDATE quota_usages SET reserved = reserved - $2 WHERE id = $1")
                .bind(usage_id)
                .bind(delta)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        for statement in [
            "DELETE FROM quota_usages WHERE project_id = $1 AND user_id = $2",
            "DELETE FROM project_user_quotas WHERE project_id = $1 AND user_id = $2",
        ] {
            sqlx::query(statement)
                .bind(project_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}
