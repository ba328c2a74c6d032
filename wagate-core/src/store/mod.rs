//! Tenant Store: the durable record of tenants.
//!
//! The store is the single writer of record for persisted tenant state.
//! Two backends implement [`TenantStore`]:
//! - **Postgres** ([`PgTenantStore`]): production backend via sqlx
//! - **Memory** ([`MemoryTenantStore`]): process-local, used by tests and dry runs

mod memory;
mod postgres;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::models::tenant::{NewTenant, Tenant, TenantId};

pub use memory::MemoryTenantStore;
pub use postgres::PgTenantStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Tenant token is already in use")]
    DuplicateToken,

    #[error("Tenant store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Create the tenants table if it does not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Round trip to the backend. Returns a backend version string.
    async fn ping(&self) -> Result<String, StoreError>;

    async fn list(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Tenants whose persisted `connected` flag is set.
    async fn connected(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Tenant>, StoreError>;

    async fn create(&self, tenant: NewTenant) -> Result<Tenant, StoreError>;

    /// Returns `false` when no tenant had that id.
    async fn delete(&self, id: TenantId) -> Result<bool, StoreError>;

    async fn set_connected(&self, id: TenantId, connected: bool) -> Result<(), StoreError>;

    /// Bind the external account id after a handshake: sets `connected`,
    /// stores `jid` and clears the pairing code.
    async fn mark_linked(&self, id: TenantId, jid: &str) -> Result<(), StoreError>;

    async fn update_webhook(
        &self,
        id: TenantId,
        webhook: &str,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError>;

    /// Replace the event subscription, leaving the webhook untouched.
    async fn update_events(
        &self,
        id: TenantId,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}
