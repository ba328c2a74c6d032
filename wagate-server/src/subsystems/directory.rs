//! Tenant lookups through the metadata cache, and tenant mutations that keep
//! the cache honest. Reads try the cache first and fall back to the store;
//! every write goes to the store and then invalidates the tenant's entries.
//! A fill that raced one of those invalidations is discarded.

use std::collections::BTreeSet;
use std::sync::Arc;
use wagate_core::{NewTenant, StoreError, Tenant, TenantId, TenantStore};

use super::cache::{CacheKey, TenantCache};

#[derive(Clone)]
pub struct TenantDirectory {
    store: Arc<dyn TenantStore>,
    cache: Arc<TenantCache>,
}

impl TenantDirectory {
    pub fn new(store: Arc<dyn TenantStore>, cache: Arc<TenantCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn TenantStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TenantCache> {
        &self.cache
    }

    pub async fn by_id(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        self.cached(CacheKey::Id(id)).await
    }

    pub async fn by_token(&self, token: &str) -> Result<Option<Tenant>, StoreError> {
        self.cached(CacheKey::Token(token.to_string())).await
    }

    async fn cached(&self, key: CacheKey) -> Result<Option<Tenant>, StoreError> {
        if let Some(tenant) = self.cache.get(&key) {
            return Ok(Some(tenant));
        }
        let epoch = self.cache.epoch();
        let fetched = match &key {
            CacheKey::Id(id) => self.store.get(*id).await?,
            CacheKey::Token(token) => self.store.find_by_token(token).await?,
        };
        if let Some(tenant) = &fetched {
            if !self.cache.put_if_current(key, tenant.clone(), epoch) {
                tracing::debug!(tenant_id = tenant.id, "Tenant changed during lookup, not caching");
            }
        }
        Ok(fetched)
    }

    pub async fn list(&self) -> Result<Vec<Tenant>, StoreError> {
        self.store.list().await
    }

    pub async fn connected(&self) -> Result<Vec<Tenant>, StoreError> {
        self.store.connected().await
    }

    pub async fn create(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        self.store.create(tenant).await
    }

    pub async fn delete(&self, id: TenantId) -> Result<bool, StoreError> {
        let deleted = self.store.delete(id).await?;
        self.cache.invalidate_tenant(id);
        Ok(deleted)
    }

    pub async fn set_connected(&self, id: TenantId, connected: bool) -> Result<(), StoreError> {
        self.store.set_connected(id, connected).await?;
        self.cache.invalidate_tenant(id);
        Ok(())
    }

    pub async fn mark_linked(&self, id: TenantId, jid: &str) -> Result<(), StoreError> {
        self.store.mark_linked(id, jid).await?;
        self.cache.invalidate_tenant(id);
        Ok(())
    }

    pub async fn update_webhook(
        &self,
        id: TenantId,
        webhook: &str,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.store.update_webhook(id, webhook, events).await?;
        self.cache.invalidate_tenant(id);
        Ok(())
    }

    pub async fn update_events(
        &self,
        id: TenantId,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.store.update_events(id, events).await?;
        self.cache.invalidate_tenant(id);
        Ok(())
    }
}
