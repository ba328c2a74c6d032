use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeSet;

use super::{StoreError, TenantStore};
use crate::models::tenant::{join_events, NewTenant, Tenant, TenantId, TenantRow};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    token TEXT NOT NULL UNIQUE,
    webhook TEXT NOT NULL DEFAULT '',
    jid TEXT NOT NULL DEFAULT '',
    qrcode TEXT NOT NULL DEFAULT '',
    connected SMALLINT NOT NULL DEFAULT 0,
    expiration BIGINT,
    events TEXT NOT NULL
)
"#;

const COLUMNS: &str = "id, name, token, webhook, jid, qrcode, connected, expiration, events";

#[derive(Debug, Clone)]
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<String, StoreError> {
        Ok(crate::db::health_check(&self.pool).await?)
    }

    async fn list(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<TenantRow> =
            sqlx::query_as(&format!("SELECT {} FROM tenants ORDER BY id", COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn connected(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<TenantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants WHERE connected = 1 ORDER BY id",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("SELECT {} FROM tenants WHERE id = $1", COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Tenant::from))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Tenant>, StoreError> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("SELECT {} FROM tenants WHERE token = $1", COLUMNS))
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Tenant::from))
    }

    async fn create(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        let result: Result<TenantRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO tenants (name, token, webhook, expiration, events)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(&tenant.name)
        .bind(&tenant.token)
        .bind(&tenant.webhook)
        .bind(tenant.expiration)
        .bind(join_events(&tenant.events))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.into()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateToken)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: TenantId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_connected(&self, id: TenantId, connected: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE tenants SET connected = $1 WHERE id = $2")
            .bind(i16::from(connected))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_linked(&self, id: TenantId, jid: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tenants SET connected = 1, jid = $1, qrcode = '' WHERE id = $2")
            .bind(jid)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_webhook(
        &self,
        id: TenantId,
        webhook: &str,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE tenants SET webhook = $1, events = $2 WHERE id = $3")
            .bind(webhook)
            .bind(join_events(events))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_events(
        &self,
        id: TenantId,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE tenants SET events = $1 WHERE id = $2")
            .bind(join_events(events))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
