//! Metadata Cache: short-lived tenant snapshots keyed by id or auth token.
//!
//! Entries expire `ttl` after they were fetched. Expiry is checked lazily on
//! `get` and eagerly by a background sweep every `sweep_interval`. The cache is
//! advisory: mutations go to the store and then invalidate entries here.
//!
//! Every invalidation bumps an epoch. A reader that fills the cache after a
//! store read passes the epoch it saw before the read to
//! [`TenantCache::put_if_current`], so a snapshot fetched before a mutation is
//! never stored after that mutation's invalidation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use wagate_core::config::CacheConfig;
use wagate_core::{Tenant, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Id(TenantId),
    Token(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tenant: Tenant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
pub struct TenantCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Only changed while holding the `entries` write lock.
    epoch: AtomicU64,
    ttl: Duration,
    sweep_interval: Duration,
}

impl TenantCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            ttl,
            sweep_interval,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.sweep_interval())
    }

    /// A missing or expired entry is a miss; expired entries are purged here.
    pub fn get(&self, key: &CacheKey) -> Option<Tenant> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.tenant.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the write lock: a concurrent put may have refreshed it.
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.tenant.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn entry(&self, tenant: Tenant) -> CacheEntry {
        CacheEntry {
            tenant,
            expires_at: Instant::now() + self.ttl,
        }
    }

    pub fn put(&self, key: CacheKey, tenant: Tenant) {
        let entry = self.entry(tenant);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    /// Current invalidation epoch. Read it before fetching from the store.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Insert only if nothing was invalidated since `seen` was read.
    /// Returns whether the entry was stored.
    pub fn put_if_current(&self, key: CacheKey, tenant: Tenant, seen: u64) -> bool {
        let entry = self.entry(tenant);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.epoch.load(Ordering::Acquire) != seen {
            return false;
        }
        entries.insert(key, entry);
        true
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        entries.remove(key);
    }

    /// Drop every entry holding a snapshot of `tenant_id`, whichever key cached it.
    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        entries.retain(|key, entry| {
            *key != CacheKey::Id(tenant_id) && entry.tenant.id != tenant_id
        });
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Keys currently held, live or not.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// Background sweep loop, spawned from `main.rs`. Exits on shutdown.
pub async fn run_sweep_loop(cache: Arc<TenantCache>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(cache.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    tracing::info!(
        interval_secs = cache.sweep_interval().as_secs(),
        "Tenant cache sweeper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = cache.sweep();
                if purged > 0 {
                    tracing::debug!(purged, remaining = cache.len(), "Tenant cache sweep");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Tenant cache sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::test_support;

    fn tenant(id: TenantId, token: &str) -> Tenant {
        test_support::tenant(id, token, false)
    }

    fn token(t: &str) -> CacheKey {
        CacheKey::Token(t.to_string())
    }

    #[test]
    fn test_put_then_get_within_ttl() {
        let cache = TenantCache::new(Duration::from_secs(60), Duration::from_secs(60));
        let a = tenant(1, "tok-A");
        cache.put(token("tok-A"), a.clone());
        assert_eq!(cache.get(&token("tok-A")), Some(a));
        assert_eq!(cache.get(&token("tok-B")), None);
    }

    #[test]
    fn test_expired_entry_is_miss_and_purged() {
        let cache = TenantCache::new(Duration::from_millis(20), Duration::from_secs(60));
        cache.put(token("tok-A"), tenant(1, "tok-A"));
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get(&token("tok-A")), None);
        assert!(
            !cache.keys().contains(&token("tok-A")),
            "expired entry must be gone from iteration, not just logically missing"
        );
    }

    #[test]
    fn test_put_refreshes_expiry() {
        let cache = TenantCache::new(Duration::from_millis(60), Duration::from_secs(60));
        cache.put(CacheKey::Id(1), tenant(1, "a"));
        std::thread::sleep(Duration::from_millis(40));
        cache.put(CacheKey::Id(1), tenant(1, "a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&CacheKey::Id(1)).is_some());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = TenantCache::new(Duration::from_millis(20), Duration::from_secs(60));
        cache.put(CacheKey::Id(1), tenant(1, "a"));
        cache.put(token("b"), tenant(2, "b"));
        std::thread::sleep(Duration::from_millis(40));
        cache.put(CacheKey::Id(3), tenant(3, "c"));

        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.keys(), vec![CacheKey::Id(3)]);
    }

    #[test]
    fn test_invalidate_tenant_drops_every_key() {
        let cache = TenantCache::new(Duration::from_secs(60), Duration::from_secs(60));
        cache.put(CacheKey::Id(1), tenant(1, "a"));
        cache.put(token("a"), tenant(1, "a"));
        cache.put(token("b"), tenant(2, "b"));

        cache.invalidate_tenant(1);
        assert_eq!(cache.keys(), vec![token("b")]);

        cache.invalidate(&token("b"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fill_after_invalidation_is_dropped() {
        let cache = TenantCache::new(Duration::from_secs(60), Duration::from_secs(60));
        let seen = cache.epoch();

        // A mutation lands between the store read and the fill.
        cache.invalidate_tenant(1);
        assert!(!cache.put_if_current(token("a"), tenant(1, "a"), seen));
        assert!(cache.is_empty());

        let seen = cache.epoch();
        assert!(cache.put_if_current(token("a"), tenant(1, "a"), seen));
        assert_eq!(cache.get(&token("a")).map(|t| t.id), Some(1));
    }

    #[tokio::test]
    async fn test_sweep_loop_purges_without_reads() {
        let cache = Arc::new(TenantCache::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
        ));
        cache.put(token("tok-A"), tenant(1, "tok-A"));

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_sweep_loop(Arc::clone(&cache), rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty(), "sweeper should have purged the stale entry");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop on shutdown")
            .unwrap();
    }
}
