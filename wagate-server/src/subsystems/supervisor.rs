//! Connection Supervisor. Decides when a tenant's connection should exist.
//!
//! Each Session moves through `Idle → Connecting → Connected → {Disconnected, Failed}`.
//! Both end states are terminal for that instance; a retry registers a new one.
//!
//! Reconciliation runs at boot and again after any fault caught by the recovery
//! middleware, so it never assumes a clean starting state: tenants that already
//! have a live session are left alone and one tenant's failure never stops the pass.
//!
//! A connection attempt runs on its own task. The caller only awaits it, so a
//! dropped request cannot leave a registered session that nobody finishes.
//! Teardown paths check [`SessionRegistry::is_superseded`] before touching the
//! persisted flag or the bridge: once a newer session owns the tenant, a late
//! teardown of the old one must not undo it.

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use wagate_core::config::SupervisorConfig;
use wagate_core::{ConnectionClient, ConnectionError, StoreError, TenantId};

use super::directory::TenantDirectory;
use super::recovery::panic_message;
use super::registry::{RegistryError, Session, SessionRegistry, SessionState};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Connection failed for tenant {tenant_id}: {source}")]
    Connect {
        tenant_id: TenantId,
        #[source]
        source: ConnectionError,
    },

    #[error("Tenant {0} was stopped while connecting")]
    Cancelled(TenantId),

    #[error("Start attempt for tenant {0} was aborted")]
    Aborted(TenantId),
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// How long `stop` waits for a worker to acknowledge cancellation.
    pub stop_grace: Duration,
    /// How often a session worker asks the client for its status.
    pub status_poll: Duration,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            stop_grace: config.stop_grace(),
            status_poll: config.status_poll(),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tenants flagged connected in the store.
    pub candidates: usize,
    /// Tenants skipped because a live session already exists.
    pub already_running: usize,
    /// Ended sessions still registered; they were removed and restarted.
    pub stale: usize,
    /// Tenants whose expiration passed; their flag was cleared.
    pub expired: usize,
    pub attempted: usize,
    pub started: usize,
    pub failed: usize,
}

pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    directory: TenantDirectory,
    client: Arc<dyn ConnectionClient>,
    settings: SupervisorSettings,
    recoveries: AtomicU64,
}

impl Supervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: TenantDirectory,
        client: Arc<dyn ConnectionClient>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            directory,
            client,
            settings,
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &TenantDirectory {
        &self.directory
    }

    /// Current state of the tenant's session, `Idle` when none is registered.
    pub fn status(&self, tenant_id: TenantId) -> SessionState {
        self.registry
            .lookup(tenant_id)
            .map(|s| s.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Number of recoveries requested by caught faults since start.
    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Start every tenant flagged connected whose expiration has not passed.
    ///
    /// Only a failure to read the store is returned; per-tenant failures are
    /// logged and counted in the report.
    pub async fn startup_reconciliation(
        self: &Arc<Self>,
    ) -> Result<ReconcileReport, SupervisorError> {
        let tenants = self.directory.connected().await?;
        let now = chrono::Utc::now().timestamp();
        let mut report = ReconcileReport {
            candidates: tenants.len(),
            ..Default::default()
        };

        let mut pending = Vec::new();
        for tenant in tenants {
            if tenant.is_expired(now) {
                report.expired += 1;
                tracing::info!(
                    tenant_id = tenant.id,
                    expiration = ?tenant.expiration,
                    "Tenant expired, clearing connected flag"
                );
                let cleared = if self.registry.lookup(tenant.id).is_some() {
                    self.stop(tenant.id).await
                } else {
                    self.directory
                        .set_connected(tenant.id, false)
                        .await
                        .map_err(SupervisorError::from)
                };
                if let Err(e) = cleared {
                    tracing::warn!(tenant_id = tenant.id, error = %e, "Failed to clear expired tenant");
                }
                continue;
            }

            if let Some(existing) = self.registry.lookup(tenant.id) {
                if !existing.state().is_terminal() {
                    report.already_running += 1;
                    continue;
                }
                tracing::warn!(
                    tenant_id = tenant.id,
                    state = ?existing.state(),
                    "Ended session still registered, replacing it"
                );
                self.registry.retire(&existing);
                report.stale += 1;
            }
            pending.push(tenant.id);
        }

        report.attempted = pending.len();
        let results = join_all(pending.iter().map(|&id| self.ensure_started(id))).await;
        for (tenant_id, result) in pending.iter().zip(results) {
            match result {
                Ok(_) => report.started += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(tenant_id, error = %e, "Tenant failed to start during reconciliation");
                }
            }
        }

        tracing::info!(
            candidates = report.candidates,
            started = report.started,
            failed = report.failed,
            expired = report.expired,
            already_running = report.already_running,
            stale = report.stale,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Return the tenant's session, starting a connection if none exists.
    pub async fn ensure_started(
        self: &Arc<Self>,
        tenant_id: TenantId,
    ) -> Result<Arc<Session>, SupervisorError> {
        let session = loop {
            if let Some(existing) = self.registry.lookup(tenant_id) {
                if !existing.state().is_terminal() {
                    return Ok(existing);
                }
                // Its worker is still tearing down; take the slot.
                self.registry.retire(&existing);
                continue;
            }
            match self.registry.register(tenant_id) {
                Ok(session) => break session,
                // Lost a race with a concurrent starter; pick up theirs.
                Err(RegistryError::AlreadyRegistered(_)) => continue,
            }
        };

        session.set_state(SessionState::Connecting);
        tracing::info!(tenant_id, client = self.client.name(), "Connecting tenant");

        let attempt = tokio::spawn(Arc::clone(self).start_session(Arc::clone(&session)));
        match attempt.await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => Err(e),
            Err(e) => {
                tracing::error!(tenant_id, error = %e, "Start task did not complete");
                Err(SupervisorError::Aborted(tenant_id))
            }
        }
    }

    /// Drive a freshly registered session to `Connected` and hand it to a
    /// worker, or tear it down. Whatever happens, the session leaves
    /// `Connecting`.
    async fn start_session(self: Arc<Self>, session: Arc<Session>) -> Result<(), SupervisorError> {
        let tenant_id = session.tenant_id();
        let guard = StartGuard {
            supervisor: Arc::clone(&self),
            session: Arc::clone(&session),
            armed: true,
        };

        let jid = match AssertUnwindSafe(self.client.connect(tenant_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(jid)) => jid,
            Ok(Err(e)) => {
                guard.disarm();
                tracing::warn!(tenant_id, error = %e, "Connection attempt failed");
                session.set_state(SessionState::Failed);
                if self.release(&session) {
                    self.persist_disconnected(tenant_id).await;
                }
                return Err(SupervisorError::Connect {
                    tenant_id,
                    source: e,
                });
            }
            Err(payload) => {
                tracing::error!(
                    tenant_id,
                    panic = %panic_message(payload.as_ref()),
                    "Connection attempt panicked"
                );
                // The armed guard releases the session on drop.
                return Err(SupervisorError::Aborted(tenant_id));
            }
        };

        if session.is_cancelled() {
            guard.disarm();
            tracing::info!(tenant_id, "Stop requested while connecting, tearing session down");
            if self.registry.is_superseded(&session) {
                tracing::info!(tenant_id, "Newer session owns the tenant, skipping disconnect");
            } else if let Err(e) = self.client.disconnect(tenant_id).await {
                tracing::warn!(tenant_id, error = %e, "Disconnect after cancelled connect failed");
            }
            session.set_state(SessionState::Disconnected);
            if self.release(&session) {
                self.persist_disconnected(tenant_id).await;
            }
            return Err(SupervisorError::Cancelled(tenant_id));
        }

        session.set_state(SessionState::Connected);
        let persisted = if jid.is_empty() {
            self.directory.set_connected(tenant_id, true).await
        } else {
            self.directory.mark_linked(tenant_id, &jid).await
        };
        if let Err(e) = persisted {
            tracing::error!(tenant_id, error = %e, "Failed to persist connected state");
        }
        tracing::info!(tenant_id, jid = %jid, "Tenant connected");

        guard.disarm();
        self.spawn_worker(session);
        Ok(())
    }

    /// Cancel the tenant's session, wait up to the grace period for it to
    /// close, then unregister it and persist `connected = false`.
    pub async fn stop(&self, tenant_id: TenantId) -> Result<(), SupervisorError> {
        match self.registry.lookup(tenant_id) {
            Some(session) => {
                session.cancel();
                if tokio::time::timeout(self.settings.stop_grace, session.closed())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        tenant_id,
                        grace_ms = self.settings.stop_grace.as_millis() as u64,
                        "Session did not close within grace period, abandoning worker"
                    );
                }
                self.registry.retire(&session);
            }
            None => tracing::debug!(tenant_id, "Stop requested for tenant without a session"),
        }

        self.directory.set_connected(tenant_id, false).await?;
        tracing::info!(tenant_id, "Tenant stopped");
        Ok(())
    }

    /// Re-run reconciliation after a caught fault. Never fails; errors are logged.
    pub async fn recover_all(self: &Arc<Self>) -> Option<ReconcileReport> {
        match self.startup_reconciliation().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Recovery reconciliation failed");
                None
            }
        }
    }

    /// Record a recovery request and run `recover_all` in the background.
    pub fn schedule_recovery(self: &Arc<Self>) {
        let count = self.recoveries.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(recoveries = count, "Scheduling session recovery");
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.recover_all().await;
        });
    }

    fn spawn_worker(self: &Arc<Self>, session: Arc<Session>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let tenant_id = session.tenant_id();
            let final_state = match AssertUnwindSafe(supervisor.run_session(&session))
                .catch_unwind()
                .await
            {
                Ok(state) => state,
                Err(payload) => {
                    tracing::error!(
                        tenant_id,
                        panic = %panic_message(payload.as_ref()),
                        "Session worker panicked"
                    );
                    SessionState::Failed
                }
            };

            session.set_state(final_state);
            if supervisor.release(&session) {
                supervisor.persist_disconnected(tenant_id).await;
            } else {
                tracing::info!(tenant_id, "Session superseded, leaving persisted state alone");
            }
            tracing::info!(tenant_id, state = ?final_state, "Session closed");
        });
    }

    /// Worker body: watch for cancellation and poll the client for a terminal
    /// status. Returns the state the session ends in.
    async fn run_session(&self, session: &Session) -> SessionState {
        let tenant_id = session.tenant_id();
        let mut ticker = tokio::time::interval(self.settings.status_poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = session.cancelled() => {
                    if !self.registry.is_superseded(session) {
                        if let Err(e) = self.client.disconnect(tenant_id).await {
                            tracing::warn!(tenant_id, error = %e, "Disconnect failed");
                        }
                    }
                    return SessionState::Disconnected;
                }
                _ = ticker.tick() => {
                    match self.client.status(tenant_id).await {
                        Ok(status) if status.is_terminal() => {
                            tracing::warn!(tenant_id, status = ?status, "Connection reported terminal status");
                            return SessionState::Failed;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(tenant_id, error = %e, "Status poll failed");
                        }
                    }
                }
            }
        }
    }

    /// Unregister an ended session. Returns `false` when a newer session has
    /// taken the tenant over; the caller then leaves the persisted flag alone.
    fn release(&self, session: &Session) -> bool {
        let superseded = self.registry.is_superseded(session);
        self.registry.retire(session);
        !superseded
    }

    async fn persist_disconnected(&self, tenant_id: TenantId) {
        if let Err(e) = self.directory.set_connected(tenant_id, false).await {
            tracing::error!(tenant_id, error = %e, "Failed to persist disconnected state");
        }
    }
}

/// Releases a session whose start attempt unwound before reaching a verdict.
/// The persisted flag is left as it was so the next reconciliation retries.
struct StartGuard {
    supervisor: Arc<Supervisor>,
    session: Arc<Session>,
    armed: bool,
}

impl StartGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            tenant_id = self.session.tenant_id(),
            "Start attempt abandoned, releasing session"
        );
        self.session.set_state(SessionState::Failed);
        self.supervisor.registry.retire(&self.session);
    }
}
