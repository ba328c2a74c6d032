use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{StoreError, TenantStore};
use crate::models::tenant::{NewTenant, Tenant, TenantId};

#[derive(Debug, Default)]
struct MemoryState {
    tenants: BTreeMap<TenantId, Tenant>,
    next_id: TenantId,
}

/// Process-local tenant store. Can be switched offline to simulate an
/// unreachable backend.
#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with fully-formed tenants, keeping their ids.
    pub fn with_tenants<I>(tenants: I) -> Self
    where
        I: IntoIterator<Item = Tenant>,
    {
        let store = Self::new();
        for tenant in tenants {
            store.insert(tenant);
        }
        store
    }

    pub fn insert(&self, tenant: Tenant) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(tenant.id);
        state.tenants.insert(tenant.id, tenant);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn update<F>(&self, id: TenantId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Tenant),
    {
        self.check_online()?;
        if let Some(tenant) = self.lock().tenants.get_mut(&id) {
            apply(tenant);
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn ping(&self) -> Result<String, StoreError> {
        self.check_online()?;
        Ok("memory".to_string())
    }

    async fn list(&self) -> Result<Vec<Tenant>, StoreError> {
        self.check_online()?;
        Ok(self.lock().tenants.values().cloned().collect())
    }

    async fn connected(&self) -> Result<Vec<Tenant>, StoreError> {
        self.check_online()?;
        Ok(self
            .lock()
            .tenants
            .values()
            .filter(|t| t.connected)
            .cloned()
            .collect())
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        self.check_online()?;
        Ok(self.lock().tenants.get(&id).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Tenant>, StoreError> {
        self.check_online()?;
        Ok(self
            .lock()
            .tenants
            .values()
            .find(|t| t.token == token)
            .cloned())
    }

    async fn create(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        self.check_online()?;
        let mut state = self.lock();
        if state.tenants.values().any(|t| t.token == tenant.token) {
            return Err(StoreError::DuplicateToken);
        }
        state.next_id += 1;
        let created = Tenant {
            id: state.next_id,
            name: tenant.name,
            token: tenant.token,
            webhook: tenant.webhook,
            jid: String::new(),
            qrcode: String::new(),
            connected: false,
            expiration: tenant.expiration,
            events: tenant.events,
        };
        state.tenants.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete(&self, id: TenantId) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(self.lock().tenants.remove(&id).is_some())
    }

    async fn set_connected(&self, id: TenantId, connected: bool) -> Result<(), StoreError> {
        self.update(id, |t| t.connected = connected)
    }

    async fn mark_linked(&self, id: TenantId, jid: &str) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.connected = true;
            t.jid = jid.to_string();
            t.qrcode.clear();
        })
    }

    async fn update_webhook(
        &self,
        id: TenantId,
        webhook: &str,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.webhook = webhook.to_string();
            t.events = events.clone();
        })
    }

    async fn update_events(
        &self,
        id: TenantId,
        events: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.update(id, |t| t.events = events.clone())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
