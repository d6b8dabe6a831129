// SPDX-License-Identifier: MIT
//!
//! HTTP/WebSocket surface (4.H): the WebSocket handshake/bridge, the REST
//! proxy routes, the gateway-app contract, streaming NDJSON, and security
//! headers.

pub mod gateway_app;
pub mod ndjson;
pub mod routes;
pub mod security;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;

use crate::router::Router;
use routes::AppState;

/// Build the full axum application: REST proxy routes plus the `/ws`
/// upgrade endpoint, both sharing one [`AppState`]. `max_body_bytes` is the
/// configured request body ceiling (`RouterConfig::max_body_bytes`).
pub fn build_app(router: Arc<Router>, max_body_bytes: usize) -> axum::Router {
    let state = AppState::new(router);
    routes::build_router(max_body_bytes)
        .route("/ws", get(ws::ws_upgrade))
        .with_state(state)
}

/// Serve `app` on `addr`, propagating the peer's socket address to
/// extractors (needed by the per-IP auth-failure rate limiter).
pub async fn serve(app: axum::Router, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}
