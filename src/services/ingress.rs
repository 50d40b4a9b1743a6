//! Axum endpoint receiving the device's push requests.
//!
//! The device is configured to call back `http://<server>/mega` whenever an
//! input changes:
//!
//! | Request | Stored as |
//! |---------|-----------|
//! | `GET /mega?pt=3` | port 3 → `ON` |
//! | `GET /mega?pt=3&m=1` | port 3 → `OFF` |
//! | `GET /mega?pt=8&v=21.5` | port 8 → `21.5` |
//! | `GET /mega?pt=5&ext=2` | child 2 of the extender wired to interrupt port 5 |
//!
//! The reply is always `d` (`text/plain`), which the device accepts as "no
//! further action". A request without a usable `pt` gets `400`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::device::{DeviceHandle, PushPayload};
use crate::traits::Transport;

/// Body the device expects in reply to a push.
pub const PUSH_REPLY: &str = "d";

// ============================================================================
// Route Handlers
// ============================================================================

/// GET /mega - push from the device
async fn push<T: Transport>(
    State(handle): State<Arc<DeviceHandle<T>>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let layout = handle.layout();
    let Some(payload) = PushPayload::from_query(&params, &layout) else {
        warn!(?params, "push without a valid port");
        return (StatusCode::BAD_REQUEST, "missing pt").into_response();
    };

    debug!(port = %payload.port, value = %payload.value, "push");
    handle.ingest_push(payload);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        PUSH_REPLY,
    )
        .into_response()
}

// ============================================================================
// Router
// ============================================================================

/// Builds the ingress router for one device.
pub fn build_router<T: Transport>(handle: Arc<DeviceHandle<T>>) -> Router {
    Router::new()
        .route("/mega", get(push::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serves the ingress router on `addr` until `token` is cancelled.
pub async fn run_server<T: Transport>(
    handle: Arc<DeviceHandle<T>>,
    addr: SocketAddr,
    token: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, device = %handle.id(), "push ingress listening");
    axum::serve(listener, build_router(handle))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
}
