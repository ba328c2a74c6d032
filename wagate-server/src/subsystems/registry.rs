//! Session Registry: which tenants have a live or starting connection.
//!
//! The registry owns the only map from tenant id to [`Session`]. Mutations
//! (`register`, `unregister`) take the write lock for the insert/remove only;
//! no operation here performs network I/O, so the lock is never held while a
//! connection is being established.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use wagate_core::TenantId;

/// Lifecycle of one Session instance. `Disconnected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tenant {0} already has a registered session")]
    AlreadyRegistered(TenantId),
}

/// In-memory record of one tenant's active or starting connection.
///
/// Holders must tolerate the connection closing at any moment after lookup.
#[derive(Debug)]
pub struct Session {
    tenant_id: TenantId,
    generation: u64,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl Session {
    fn new(tenant_id: TenantId, generation: u64) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            tenant_id,
            generation,
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next`. Terminal states are final; transitions out of them are ignored.
    pub fn set_state(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Fire the one-shot cancel signal. Repeated calls have no further effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Resolves once the session reaches a terminal state.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<TenantId, Arc<Session>>>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant_id: TenantId) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&tenant_id) {
            return Err(RegistryError::AlreadyRegistered(tenant_id));
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(tenant_id, generation));
        sessions.insert(tenant_id, Arc::clone(&session));
        Ok(session)
    }

    pub fn lookup(&self, tenant_id: TenantId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .cloned()
    }

    /// Remove the tenant's session and fire its cancel signal. No-op if absent.
    pub fn unregister(&self, tenant_id: TenantId) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tenant_id);
        if let Some(session) = removed {
            session.cancel();
        }
    }

    /// Remove `session` only if it is still the registered instance for its
    /// tenant. A late teardown of an old session never evicts its successor.
    pub fn retire(&self, session: &Session) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(&session.tenant_id) {
                Some(current) if current.generation == session.generation => {
                    sessions.remove(&session.tenant_id)
                }
                _ => None,
            }
        };
        session.cancel();
        removed.is_some()
    }

    /// True when a different session now holds the tenant's slot.
    pub fn is_superseded(&self, session: &Session) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session.tenant_id)
            .is_some_and(|current| current.generation != session.generation)
    }

    /// Snapshot of registered tenant ids, sorted. May be stale immediately.
    pub fn all(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
