//! Wagate HTTP API
//!
//! Axum router in front of the Connection Supervisor. Each endpoint has a thin
//! axum handler that delegates to an inner function returning
//! `(StatusCode, serde_json::Value)`, so the logic is testable without routing.
//!
//! Endpoints:
//! - GET    /health              store reachability and session counters
//! - GET    /version             server version info
//! - POST   /session/connect     ensure the caller's session is started
//! - POST   /session/disconnect  stop the caller's session
//! - GET    /session/status      live state plus persisted flags
//! - GET    /webhook             webhook URL and subscribed events
//! - POST   /webhook             update webhook URL and events
//! - GET    /admin/users         list tenants
//! - POST   /admin/users         create a tenant
//! - DELETE /admin/users/:id     stop and delete a tenant
//!
//! Tenant routes authenticate with the `token` header; admin routes with the
//! `Authorization` header.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::error_handling::HandleErrorLayer;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{BoxError, Extension, Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use wagate_core::models::tenant::first_unsupported_event;
use wagate_core::{NewTenant, StoreError, Tenant, TenantId};

use crate::subsystems::recovery;
use crate::subsystems::registry::SessionState;
use crate::subsystems::supervisor::{Supervisor, SupervisorError};

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub supervisor: Arc<Supervisor>,
    pub admin_token: Option<String>,
}

/// Build the router with every endpoint, the request timeout, and the panic
/// recovery layer outermost.
pub fn build_router(state: Arc<HttpState>, request_timeout: Duration) -> Router {
    let tenant_routes = Router::new()
        .route("/session/connect", post(connect_handler))
        .route("/session/disconnect", post(disconnect_handler))
        .route("/session/status", get(status_handler))
        .route("/webhook", get(get_webhook_handler).post(set_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_tenant,
        ));

    let admin_routes = Router::new()
        .route("/admin/users", get(list_users_handler).post(add_user_handler))
        .route("/admin/users/:id", delete(delete_user_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_admin,
        ));

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .merge(tenant_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .timeout(request_timeout),
        )
        .with_state(Arc::clone(&state));

    recovery::with_recovery(router, Arc::clone(&state.supervisor))
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ConnectRequest {
    /// Event tags to subscribe the webhook to. Empty keeps the current set.
    #[serde(default, alias = "Subscribe")]
    pub subscribe: Vec<String>,
    /// Answer 202 right away and connect in the background.
    #[serde(default, alias = "Immediate")]
    pub immediate: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookRequest {
    #[serde(default, alias = "webhookURL")]
    pub webhook: String,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    pub logged_in: bool,
    pub jid: String,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(supervisor: &Supervisor) -> (StatusCode, serde_json::Value) {
    let store = supervisor.directory().store();
    match store.ping().await {
        Ok(version) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": store.name(),
                "store_version": version,
                "sessions": supervisor.registry().len(),
                "recoveries": supervisor.recovery_count(),
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "service": "wagate",
    })
}

pub async fn connect_inner(
    supervisor: &Arc<Supervisor>,
    tenant: &Tenant,
    req: ConnectRequest,
) -> (StatusCode, serde_json::Value) {
    let events: BTreeSet<String> = req.subscribe.into_iter().collect();
    if let Some(bad) = first_unsupported_event(&events) {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("unsupported event type: {}", bad),
        );
    }

    let live = supervisor
        .registry()
        .lookup(tenant.id)
        .filter(|session| !session.state().is_terminal());
    if let Some(session) = live {
        return error_body(
            StatusCode::CONFLICT,
            format!("already connected ({:?})", session.state()),
        );
    }

    if !events.is_empty() {
        if let Err(e) = supervisor
            .directory()
            .update_events(tenant.id, &events)
            .await
        {
            return store_error(e);
        }
    }

    if req.immediate {
        let supervisor = Arc::clone(supervisor);
        let tenant_id = tenant.id;
        tokio::spawn(async move {
            if let Err(e) = supervisor.ensure_started(tenant_id).await {
                tracing::warn!(tenant_id, error = %e, "Background connect failed");
            }
        });
        return (
            StatusCode::ACCEPTED,
            serde_json::json!({
                "details": "connecting",
                "events": events,
            }),
        );
    }

    match supervisor.ensure_started(tenant.id).await {
        Ok(session) => {
            let jid = match supervisor.directory().by_id(tenant.id).await {
                Ok(Some(fresh)) => fresh.jid,
                _ => String::new(),
            };
            (
                StatusCode::OK,
                serde_json::json!({
                    "details": "connected",
                    "state": session.state(),
                    "jid": jid,
                    "events": events,
                }),
            )
        }
        Err(e) => supervisor_error(e),
    }
}

pub async fn disconnect_inner(
    supervisor: &Supervisor,
    tenant: &Tenant,
) -> (StatusCode, serde_json::Value) {
    if supervisor.registry().lookup(tenant.id).is_none() {
        return error_body(StatusCode::CONFLICT, "no session");
    }
    match supervisor.stop(tenant.id).await {
        Ok(()) => (
            StatusCode::OK,
            serde_json::json!({ "details": "disconnected" }),
        ),
        Err(e) => supervisor_error(e),
    }
}

pub async fn status_inner(
    supervisor: &Supervisor,
    tenant: &Tenant,
) -> (StatusCode, serde_json::Value) {
    let persisted = match supervisor.directory().by_id(tenant.id).await {
        Ok(Some(t)) => t,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "tenant not found"),
        Err(e) => return store_error(e),
    };
    let status = SessionStatus {
        state: supervisor.status(tenant.id),
        connected: persisted.connected,
        logged_in: persisted.is_linked(),
        jid: persisted.jid,
    };
    (StatusCode::OK, serde_json::json!(status))
}

pub fn get_webhook_inner(tenant: &Tenant) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::OK,
        serde_json::json!({
            "webhook": tenant.webhook,
            "subscribe": tenant.events,
        }),
    )
}

pub async fn set_webhook_inner(
    supervisor: &Supervisor,
    tenant: &Tenant,
    req: WebhookRequest,
) -> (StatusCode, serde_json::Value) {
    let events: BTreeSet<String> = if req.events.is_empty() {
        tenant.events.clone()
    } else {
        req.events.into_iter().collect()
    };
    if let Some(bad) = first_unsupported_event(&events) {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("unsupported event type: {}", bad),
        );
    }

    match supervisor
        .directory()
        .update_webhook(tenant.id, &req.webhook, &events)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            serde_json::json!({
                "webhook": req.webhook,
                "events": events,
            }),
        ),
        Err(e) => store_error(e),
    }
}

pub async fn list_users_inner(supervisor: &Supervisor) -> (StatusCode, serde_json::Value) {
    match supervisor.directory().list().await {
        Ok(tenants) => (StatusCode::OK, serde_json::json!(tenants)),
        Err(e) => store_error(e),
    }
}

pub async fn add_user_inner(
    supervisor: &Supervisor,
    new: NewTenant,
) -> (StatusCode, serde_json::Value) {
    if new.name.trim().is_empty() || new.token.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "name and token are required");
    }
    if let Some(bad) = first_unsupported_event(&new.events) {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("unsupported event type: {}", bad),
        );
    }

    match supervisor.directory().create(new).await {
        Ok(tenant) => {
            tracing::info!(tenant_id = tenant.id, name = %tenant.name, "Tenant created");
            (StatusCode::CREATED, serde_json::json!(tenant))
        }
        Err(StoreError::DuplicateToken) => {
            error_body(StatusCode::CONFLICT, "token already in use")
        }
        Err(e) => store_error(e),
    }
}

pub async fn delete_user_inner(
    supervisor: &Supervisor,
    tenant_id: TenantId,
) -> (StatusCode, serde_json::Value) {
    if supervisor.registry().lookup(tenant_id).is_some() {
        if let Err(e) = supervisor.stop(tenant_id).await {
            tracing::warn!(tenant_id, error = %e, "Stop before delete failed");
        }
    }

    match supervisor.directory().delete(tenant_id).await {
        Ok(true) => {
            tracing::info!(tenant_id, "Tenant deleted");
            (StatusCode::OK, serde_json::json!({ "id": tenant_id, "deleted": true }))
        }
        Ok(false) => error_body(StatusCode::NOT_FOUND, "tenant not found"),
        Err(e) => store_error(e),
    }
}

// ============================================================================
// Authentication middleware
// ============================================================================

/// Resolve the `token` header to a tenant through the metadata cache and hand
/// it to the handler as an `Extension<Tenant>`.
pub async fn require_tenant(
    State(state): State<Arc<HttpState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get("token")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        Some(t) => t.to_string(),
        None => return reply(error_body(StatusCode::UNAUTHORIZED, "missing token header")),
    };

    match state.supervisor.directory().by_token(&token).await {
        Ok(Some(tenant)) => {
            request.extensions_mut().insert(tenant);
            next.run(request).await
        }
        Ok(None) => reply(error_body(StatusCode::UNAUTHORIZED, "unauthorized")),
        Err(e) => reply(store_error(e)),
    }
}

pub async fn require_admin(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match (state.admin_token.as_deref(), presented) {
        (Some(expected), Some(given)) if !expected.is_empty() && expected == given => {
            next.run(request).await
        }
        _ => reply(error_body(StatusCode::UNAUTHORIZED, "unauthorized")),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    reply(health_inner(&state.supervisor).await)
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn connect_handler(
    State(state): State<Arc<HttpState>>,
    Extension(tenant): Extension<Tenant>,
    body: Bytes,
) -> impl IntoResponse {
    match parse_optional_body::<ConnectRequest>(&body) {
        Ok(req) => reply(connect_inner(&state.supervisor, &tenant, req).await),
        Err(rejection) => reply(rejection),
    }
}

pub async fn disconnect_handler(
    State(state): State<Arc<HttpState>>,
    Extension(tenant): Extension<Tenant>,
) -> impl IntoResponse {
    reply(disconnect_inner(&state.supervisor, &tenant).await)
}

pub async fn status_handler(
    State(state): State<Arc<HttpState>>,
    Extension(tenant): Extension<Tenant>,
) -> impl IntoResponse {
    reply(status_inner(&state.supervisor, &tenant).await)
}

pub async fn get_webhook_handler(Extension(tenant): Extension<Tenant>) -> impl IntoResponse {
    reply(get_webhook_inner(&tenant))
}

pub async fn set_webhook_handler(
    State(state): State<Arc<HttpState>>,
    Extension(tenant): Extension<Tenant>,
    body: Bytes,
) -> impl IntoResponse {
    match parse_optional_body::<WebhookRequest>(&body) {
        Ok(req) => reply(set_webhook_inner(&state.supervisor, &tenant, req).await),
        Err(rejection) => reply(rejection),
    }
}

pub async fn list_users_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    reply(list_users_inner(&state.supervisor).await)
}

pub async fn add_user_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> impl IntoResponse {
    match parse_optional_body::<NewTenant>(&body) {
        Ok(new) => reply(add_user_inner(&state.supervisor, new).await),
        Err(rejection) => reply(rejection),
    }
}

pub async fn delete_user_handler(
    State(state): State<Arc<HttpState>>,
    Path(tenant_id): Path<TenantId>,
) -> impl IntoResponse {
    reply(delete_user_inner(&state.supervisor, tenant_id).await)
}

async fn handle_timeout(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        reply(error_body(StatusCode::REQUEST_TIMEOUT, "request timed out"))
    } else {
        tracing::error!(error = %err, "Unhandled middleware error");
        recovery::internal_error_response()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Standard error envelope.
pub fn error_body(status: StatusCode, msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    (
        status,
        serde_json::json!({
            "error": msg.into(),
            "status": "error",
        }),
    )
}

fn reply((status, body): (StatusCode, serde_json::Value)) -> Response {
    (status, Json(body)).into_response()
}

/// An empty body yields `T::default()`; anything else must be valid JSON.
pub fn parse_optional_body<T>(body: &[u8]) -> Result<T, (StatusCode, serde_json::Value)>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", e)))
}

fn store_error(e: StoreError) -> (StatusCode, serde_json::Value) {
    tracing::error!(error = %e, "Tenant store error");
    match e {
        StoreError::DuplicateToken => error_body(StatusCode::CONFLICT, "token already in use"),
        _ => error_body(StatusCode::SERVICE_UNAVAILABLE, "tenant store unavailable"),
    }
}

fn supervisor_error(e: SupervisorError) -> (StatusCode, serde_json::Value) {
    match e {
        SupervisorError::Store(e) => store_error(e),
        SupervisorError::Connect { .. } => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
        SupervisorError::Cancelled(_) => error_body(StatusCode::CONFLICT, e.to_string()),
        SupervisorError::Aborted(tenant_id) => {
            tracing::error!(tenant_id, "Connect request ended without a result");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

// ============================================================================
// Unit Tests (inner functions against the in-memory store)
// ============================================================================
