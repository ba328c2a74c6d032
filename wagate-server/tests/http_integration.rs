//! End-to-end router tests: in-memory tenant store, the real HTTP bridge
//! client pointed at a wiremock bridge, and `oneshot` dispatch through every
//! layer (auth, timeout, recovery).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use tower::ServiceExt;
use wagate_core::{HttpBridgeClient, MemoryTenantStore, Tenant, TenantStore, WagateConfig};
use wagate_server::http::{build_router, HttpState};
use wagate_server::server::build_supervisor;
use wagate_server::subsystems::supervisor::Supervisor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ADMIN: &str = "admin-secret";

fn tenant(id: i64, token: &str, connected: bool) -> Tenant {
    Tenant {
        id,
        name: format!("tenant-{}", id),
        token: token.to_string(),
        webhook: String::new(),
        jid: String::new(),
        qrcode: String::new(),
        connected,
        expiration: None,
        events: BTreeSet::new(),
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryTenantStore>,
    supervisor: Arc<Supervisor>,
    bridge: MockServer,
}

async fn harness(tenants: Vec<Tenant>, admin_token: Option<&str>) -> Harness {
    let bridge = MockServer::start().await;

    let mut config = WagateConfig::default();
    config.bridge.base_url = bridge.uri();
    config.bridge.max_retries = 0;
    config.bridge.retry_delay_ms = 1;
    config.bridge.timeout_seconds = 5;
    config.supervisor.status_poll_seconds = 3_600;
    config.supervisor.stop_grace_seconds = 1;

    let store = Arc::new(MemoryTenantStore::with_tenants(tenants));
    let client = Arc::new(HttpBridgeClient::new(&config.bridge).unwrap());
    let supervisor = build_supervisor(store.clone(), client, &config);

    let state = Arc::new(HttpState {
        supervisor: Arc::clone(&supervisor),
        admin_token: admin_token.map(str::to_string),
    });
    let app = build_router(state, Duration::from_secs(10));

    Harness {
        app,
        store,
        supervisor,
        bridge,
    }
}

async fn mount_connect(bridge: &MockServer, id: i64, jid: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/sessions/{}/connect", id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "jid": jid })))
        .mount(bridge)
        .await;
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn tenant_req(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("token", token)
        .header("content-type", "application/json");
    match body {
        Some(b) => builder.body(Body::from(b.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

// ===========================================================================
// Public endpoints
// ===========================================================================

#[tokio::test]
async fn test_version_and_health() {
    let h = harness(vec![], None).await;

    let req = Request::builder().uri("/version").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "wagate");

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");
    assert_eq!(body["sessions"], 0);

    h.store.set_offline(true);
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ===========================================================================
// Tenant authentication
// ===========================================================================

#[tokio::test]
async fn test_tenant_routes_require_known_token() {
    let h = harness(vec![tenant(1, "tok-1", false)], None).await;

    let req = Request::builder()
        .method("GET")
        .uri("/session/status")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let (status, _) = send(&h.app, tenant_req("GET", "/session/status", "wrong", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&h.app, tenant_req("GET", "/session/status", "tok-1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "idle");
}

// ===========================================================================
// Session lifecycle through the bridge
// ===========================================================================

#[tokio::test]
async fn test_connect_status_disconnect_round_trip() {
    let h = harness(vec![tenant(1, "tok-1", false)], None).await;
    mount_connect(&h.bridge, 1, "5511@s.whatsapp.net").await;
    Mock::given(method("POST"))
        .and(path("/sessions/1/disconnect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&h.bridge)
        .await;

    let (status, body) = send(
        &h.app,
        tenant_req("POST", "/session/connect", "tok-1", Some(json!({"Subscribe": ["Message"]}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(body["jid"], "5511@s.whatsapp.net");

    let (status, body) = send(&h.app, tenant_req("GET", "/session/status", "tok-1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "connected");
    assert_eq!(body["connected"], true);
    assert_eq!(body["logged_in"], true);

    let (status, _) = send(&h.app, tenant_req("POST", "/session/connect", "tok-1", None)).await;
    assert_eq!(status, StatusCode::CONFLICT, "second connect must not start another session");

    let (status, _) = send(&h.app, tenant_req("POST", "/session/disconnect", "tok-1", None)).await;
    assert_eq!(status, StatusCode::OK);

    let persisted = h.store.get(1).await.unwrap().unwrap();
    assert!(!persisted.connected);
    assert!(persisted.events.contains("Message"));
    assert!(h.supervisor.registry().is_empty());
}

#[tokio::test]
async fn test_bridge_rejection_maps_to_bad_gateway() {
    let h = harness(vec![tenant(2, "tok-2", true)], None).await;
    Mock::given(method("POST"))
        .and(path("/sessions/2/connect"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "banned"})))
        .expect(1)
        .mount(&h.bridge)
        .await;

    let (status, body) = send(&h.app, tenant_req("POST", "/session/connect", "tok-2", None)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("banned"));

    assert!(!h.store.get(2).await.unwrap().unwrap().connected);
    assert!(h.supervisor.registry().is_empty());
}

#[tokio::test]
async fn test_startup_reconciliation_restores_sessions() {
    let mut expired = tenant(3, "tok-3", true);
    expired.expiration = Some(1);
    let h = harness(
        vec![tenant(1, "tok-1", true), tenant(2, "tok-2", false), expired],
        None,
    )
    .await;
    mount_connect(&h.bridge, 1, "1@s.whatsapp.net").await;

    let report = h.supervisor.startup_reconciliation().await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(report.expired, 1);

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (_, body) = send(&h.app, req).await;
    assert_eq!(body["sessions"], 1);

    let (_, body) = send(&h.app, tenant_req("GET", "/session/status", "tok-1", None)).await;
    assert_eq!(body["state"], "connected");
    let (_, body) = send(&h.app, tenant_req("GET", "/session/status", "tok-3", None)).await;
    assert_eq!(body["state"], "idle");
    assert_eq!(body["connected"], false);
}

// ===========================================================================
// Webhook
// ===========================================================================

#[tokio::test]
async fn test_webhook_update_is_visible_through_cache() {
    let h = harness(vec![tenant(1, "tok-1", false)], None).await;

    let (status, body) = send(&h.app, tenant_req("GET", "/webhook", "tok-1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["webhook"], "");

    let update = json!({"webhookURL": "https://hooks.test/in", "events": ["Message"]});
    let (status, _) = send(&h.app, tenant_req("POST", "/webhook", "tok-1", Some(update))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&h.app, tenant_req("GET", "/webhook", "tok-1", None)).await;
    assert_eq!(body["webhook"], "https://hooks.test/in");
    assert_eq!(body["subscribe"], json!(["Message"]));

    let bad = json!({"webhook": "x", "events": ["NotAnEvent"]});
    let (status, _) = send(&h.app, tenant_req("POST", "/webhook", "tok-1", Some(bad))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ===========================================================================
// Admin routes
// ===========================================================================

fn admin_req(method: &str, uri: &str, auth: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    match body {
        Some(b) => builder.body(Body::from(b.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn test_admin_routes_refused_without_configured_token() {
    let h = harness(vec![], None).await;
    let (status, _) = send(&h.app, admin_req("GET", "/admin/users", Some(""), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&h.app, admin_req("GET", "/admin/users", Some("anything"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_user_management() {
    let h = harness(vec![], Some(ADMIN)).await;

    let (status, _) = send(&h.app, admin_req("GET", "/admin/users", Some("nope"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let new_user = json!({"name": "acme", "token": "tok-acme", "events": ["Message"]});
    let (status, created) =
        send(&h.app, admin_req("POST", "/admin/users", Some(ADMIN), Some(new_user.clone()))).await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", created);
    let id = created["id"].as_i64().unwrap();

    let (status, _) =
        send(&h.app, admin_req("POST", "/admin/users", Some(ADMIN), Some(new_user))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, list) = send(&h.app, admin_req("GET", "/admin/users", Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    // The new tenant can authenticate right away.
    let (status, _) = send(&h.app, tenant_req("GET", "/session/status", "tok-acme", None)).await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!("/admin/users/{}", id);
    let (status, _) = send(&h.app, admin_req("DELETE", &uri, Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.app, admin_req("DELETE", &uri, Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Deleting invalidated the cached token.
    let (status, _) = send(&h.app, tenant_req("GET", "/session/status", "tok-acme", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
