//! Recovery Middleware. Keeps a panicking handler from taking the process
//! down or leaving sessions out of step with the store.
//!
//! On a panic the middleware logs the payload, schedules
//! [`Supervisor::recover_all`](super::supervisor::Supervisor::recover_all), and
//! answers with a generic 500 that carries no internal detail.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::supervisor::Supervisor;

/// Wrap every route of `router` with [`recover_panics`]. Apply last so no
/// route is left outside the guard.
pub fn with_recovery(router: Router, supervisor: Arc<Supervisor>) -> Router {
    router.layer(middleware::from_fn_with_state(supervisor, recover_panics))
}

pub async fn recover_panics(
    State(supervisor): State<Arc<Supervisor>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            tracing::error!(
                %method,
                path = %path,
                panic = %panic_message(payload.as_ref()),
                "Recovered from panic in request handler"
            );
            supervisor.schedule_recovery();
            internal_error_response()
        }
    }
}

pub fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "Internal Server Error",
            "status": "error",
        })),
    )
        .into_response()
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
