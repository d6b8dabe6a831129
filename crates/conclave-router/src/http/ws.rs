// SPDX-License-Identifier: MIT
//!
//! WebSocket transport (4.B/4.H): the handshake that turns an accepted
//! socket into a registered [`Peer`], and the two tasks that bridge it to
//! the router afterwards — a reader that feeds inbound binary frames into
//! [`Router::route_frame`], and a writer that drains the peer's
//! [`InProcessTransport`] outbound queue onto the socket. Reusing
//! `InProcessTransport` here (rather than a bespoke `WebSocketTransport`)
//! is deliberate: the bounded-queue/backpressure semantics the router
//! expects from every transport are already implemented there, and a real
//! socket only needs *something* draining the receiver side.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::auth::UserIdentity;
use crate::error::RouterError;
use crate::peer::{InProcessTransport, Peer, PeerTransport};
use crate::router::Router;

use super::routes::AppState;

/// First (and only) text frame a client sends before the connection is
/// admitted.
#[derive(Debug, Deserialize, Default)]
struct Handshake {
    token: Option<String>,
    workspace: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConnectionInfo {
    r#type: &'static str,
    hypha_version: &'static str,
    manager_id: String,
    workspace: String,
    client_id: String,
    user: UserIdentity,
    /// An opaque token this client can reconnect with, re-granting the same
    /// workspace without re-authenticating. Minted the same way
    /// `generate_token` would for this caller/workspace pair.
    reconnection_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct HandshakeError {
    r#type: &'static str,
    error: String,
    detail: String,
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.router.clone()))
}

async fn handle_socket(mut socket: WebSocket, router: Arc<Router>) {
    let handshake = match read_handshake(&mut socket).await {
        Ok(h) => h,
        Err(e) => {
            close_with_error(&mut socket, &e).await;
            return;
        }
    };

    let outcome = match router.auth.authenticate(handshake.token.as_deref()) {
        Ok(o) => o,
        Err(e) => {
            close_with_error(&mut socket, &e).await;
            return;
        }
    };

    let workspace = match router.workspaces.resolve_for_handshake(
        outcome.requested_workspace.as_deref(),
        handshake.workspace.as_deref(),
        &outcome.user,
    ) {
        Ok(w) => w,
        Err(e) => {
            close_with_error(&mut socket, &e).await;
            return;
        }
    };

    crate::workspace_service::ensure_installed(&router, &workspace, &router.default_service);

    let client_id = handshake
        .client_id
        .or(outcome.requested_client_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (transport, mut outbound_rx) = InProcessTransport::new(crate::router::DEFAULT_BACKPRESSURE_LIMIT);
    let peer = Arc::new(Peer::new(workspace.id.clone(), client_id.clone(), outcome.user.clone(), transport));

    if let Err(e) = workspace.insert_peer(peer.clone()) {
        close_with_error(&mut socket, &e).await;
        return;
    }
    workspace.publish("client_connected", serde_json::json!({"client_id": client_id}));

    let reconnection_token = router
        .auth
        .generate_token(
            crate::auth::GenerateTokenConfig {
                user_id: Some(outcome.user.id.clone()),
                workspace: Some(workspace.id.clone()),
                client_id: Some(client_id.clone()),
                ..Default::default()
            },
            &outcome.user,
            &workspace.id,
        )
        .ok();

    let info = ConnectionInfo {
        r#type: "connection_info",
        hypha_version: env!("CARGO_PKG_VERSION"),
        manager_id: format!("{}/{}", workspace.id, crate::workspace::WORKSPACE_MANAGER_CLIENT_ID),
        workspace: workspace.id.clone(),
        client_id: client_id.clone(),
        user: outcome.user.clone(),
        reconnection_token,
    };
    let Ok(info_text) = serde_json::to_string(&info) else {
        return;
    };
    if socket.send(Message::Text(info_text)).await.is_err() {
        workspace.remove_peer(&client_id).await;
        router.workspaces.destroy_if_empty(&workspace.id);
        return;
    }

    let (mut sink, mut stream) = socket.split();

    // The writer drains two sources onto the same socket: RPC frames
    // addressed to this peer, and workspace events this peer subscribed
    // to via `on` (4.G) — the latter pushed as a standalone text message,
    // same as `ConnectionInfo`, rather than wrapped in the RPC envelope.
    let mut event_rx = workspace.subscribe();
    let event_peer = peer.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                bytes = outbound_rx.recv() => {
                    match bytes {
                        Some(bytes) => {
                            if sink.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Ok(event) if event_peer.is_subscribed_to_event(&event.event) => {
                            let msg = serde_json::json!({
                                "type": "event",
                                "event": event.event,
                                "payload": event.payload,
                            });
                            let Ok(text) = serde_json::to_string(&msg) else { continue };
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(bytes)) => {
                if let Err(e) = router.route_frame(&peer, &bytes).await {
                    debug!(error = %e, client = %client_id, "frame routing failed");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, client = %client_id, "websocket read error");
                break;
            }
        }
    }

    peer.transport.close(1000, "client disconnected").await;
    writer.abort();
    workspace.remove_peer(&client_id).await;
    workspace.publish("client_disconnected", serde_json::json!({"client_id": client_id}));
    router.workspaces.destroy_if_empty(&workspace.id);
}

async fn read_handshake(socket: &mut WebSocket) -> Result<Handshake, RouterError> {
    match socket.next().await {
        Some(Ok(Message::Text(text))) => {
            serde_json::from_str(&text).map_err(|e| RouterError::MalformedFrame(format!("handshake: {e}")))
        }
        Some(Ok(Message::Binary(bytes))) => {
            serde_json::from_slice(&bytes).map_err(|e| RouterError::MalformedFrame(format!("handshake: {e}")))
        }
        Some(Ok(Message::Close(_))) | None => Err(RouterError::TransportClosed),
        Some(Err(e)) => Err(RouterError::MalformedFrame(e.to_string())),
        _ => Err(RouterError::MalformedFrame("expected a handshake frame".into())),
    }
}

/// Close with WebSocket code 1008 (policy violation) and the error's
/// stable kind as the close reason, per §7's handshake-error propagation
/// policy.
async fn close_with_error(socket: &mut WebSocket, err: &RouterError) {
    let body = HandshakeError {
        r#type: "error",
        error: err.kind().to_string(),
        detail: err.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&body) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: err.kind().into(),
        })))
        .await;
}
