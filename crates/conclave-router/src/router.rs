// SPDX-License-Identifier: MIT
//!
//! Address-based frame dispatch (4.D).
//!
//! `Router` owns the [`WorkspaceRegistry`] and the table of in-flight
//! request/response correlations used by [`Router::call`] — the "remote
//! call handle" semantics of `get_service` (4.F) and the workspace
//! service's own method dispatch (4.G) both go through it, so a call to a
//! locally-hosted service and a call forwarded to a sibling router look
//! identical to the caller.
//!
//! The frame payload's own wire semantics are explicitly out of scope for
//! the core (`spec.md` §1) and left to "the peer library" — here that role
//! is filled by a small JSON request/response envelope (see
//! [`RpcRequest`]/[`RpcResponse`]), the simplest choice that lets the
//! in-process test peers and the HTTP proxy round-trip real calls.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{Authenticator, UserIdentity};
use crate::cluster::ClusterCoordinator;
use crate::error::{RouterError, RouterResult};
use crate::frame::{self, Frame, FrameHeader};
use crate::peer::{Peer, SendOutcome};
use crate::workspace::WorkspaceRegistry;

/// Outbound queue high-water mark before a send is treated as backpressure
/// (4.D "Back-pressure").
pub const DEFAULT_BACKPRESSURE_LIMIT: usize = crate::peer::InProcessTransport::DEFAULT_QUEUE_DEPTH;

/// Default pending-RPC timeout (§6 `method_timeout_s`).
pub const DEFAULT_METHOD_TIMEOUT_S: u64 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&RouterError> for RpcErrorBody {
    fn from(e: &RouterError) -> Self {
        RpcErrorBody {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// The router's owned state: all workspaces, auth, and in-flight calls.
/// Matches Design Note "global registries" — one explicit value, not a
/// process-wide static.
pub struct Router {
    pub workspaces: WorkspaceRegistry,
    pub auth: Arc<Authenticator>,
    pub cluster: std::sync::RwLock<Option<Arc<ClusterCoordinator>>>,
    /// Config-supplied `default_service` map (§6), installed alongside the
    /// built-ins on every workspace's manager peer.
    pub default_service: std::collections::HashMap<String, serde_json::Value>,
    pending: DashMap<String, oneshot::Sender<RouterResult<serde_json::Value>>>,
    method_timeout: Duration,
}

impl Router {
    pub fn new(auth: Arc<Authenticator>) -> Arc<Self> {
        Self::with_timeout(auth, Duration::from_secs(DEFAULT_METHOD_TIMEOUT_S))
    }

    pub fn with_timeout(auth: Arc<Authenticator>, method_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            workspaces: WorkspaceRegistry::new(),
            auth,
            cluster: std::sync::RwLock::new(None),
            default_service: std::collections::HashMap::new(),
            pending: DashMap::new(),
            method_timeout,
        })
    }

    pub fn with_default_service(
        auth: Arc<Authenticator>,
        method_timeout: Duration,
        default_service: std::collections::HashMap<String, serde_json::Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workspaces: WorkspaceRegistry::new(),
            auth,
            cluster: std::sync::RwLock::new(None),
            default_service,
            pending: DashMap::new(),
            method_timeout,
        })
    }

    pub fn set_cluster(&self, coordinator: Arc<ClusterCoordinator>) {
        *self.cluster.write().unwrap() = Some(coordinator);
    }

    /// Entry point for an inbound frame from an already-authenticated peer
    /// `sender` (known to be `workspace/client`). Implements 4.D steps 2-6.
    pub async fn route_frame(&self, sender: &Peer, raw: &[u8]) -> RouterResult<()> {
        let decoded = match frame::decode(raw) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "dropping unroutable frame");
                return Err(e);
            }
        };

        let sender_fqid = sender.id();
        if decoded.header.from != sender_fqid && !decoded.header.from.is_empty() {
            debug!(claimed = %decoded.header.from, actual = %sender_fqid, "rejecting spoofed 'from'");
        }

        let mut header = decoded.header;
        header.from = sender_fqid.clone();

        let to = normalize_recipient(&header.to, &sender.workspace)?;
        let recipient_ws = workspace_of(&to);
        header.to = to.clone();
        header.ws = Some(recipient_ws.clone());
        header.user = Some(serde_json::to_value(&sender.user).unwrap_or(serde_json::Value::Null));

        let out_bytes = frame::encode(&header, &decoded.payload)?;
        self.deliver(&to, &recipient_ws, out_bytes, &header).await
    }

    async fn deliver(
        &self,
        to: &str,
        recipient_ws: &str,
        bytes: Vec<u8>,
        header: &FrameHeader,
    ) -> RouterResult<()> {
        if let Some(ws) = self.workspaces.get(recipient_ws) {
            let client = client_segment(to);
            if let Some(peer) = ws.get_peer(&client) {
                return match peer.transport.send(bytes).await {
                    SendOutcome::Sent => Ok(()),
                    SendOutcome::QueueFull => {
                        self.reply_error(header, RouterError::BackpressureDrop).await;
                        Err(RouterError::BackpressureDrop)
                    }
                    SendOutcome::Closed => {
                        self.reply_error(header, RouterError::TransportClosed).await;
                        Err(RouterError::TransportClosed)
                    }
                };
            }
        }

        if let Some(cluster) = self.cluster.read().unwrap().clone() {
            if cluster.forward(to, bytes.clone()).await.is_ok() {
                return Ok(());
            }
        }

        warn!(to = %to, "recipient unknown, dropping frame");
        self.reply_error(header, RouterError::RecipientUnknown(to.to_string()))
            .await;
        Err(RouterError::RecipientUnknown(to.to_string()))
    }

    /// Synthesize an error reply back to the original sender when the
    /// frame's payload was an `RpcRequest` (so it expected a reply).
    async fn reply_error(&self, header: &FrameHeader, err: RouterError) {
        if let Ok(id) = extract_request_id(header) {
            self.resolve_pending(&id, Err(err));
        }
    }

    /// Perform a call to `to` (fully-qualified service member, e.g.
    /// `ws/client:service.method`) on behalf of `from`, awaiting the
    /// correlated reply or `RequestTimeout`.
    pub async fn call(
        &self,
        from: &Peer,
        to_fqid: &str,
        method: &str,
        args: serde_json::Value,
    ) -> RouterResult<serde_json::Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            args,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| RouterError::ServiceError(format!("encode request: {e}")))?;

        let mut header = FrameHeader::new(from.id(), to_fqid.to_string());
        header.ws = Some(workspace_of(to_fqid));
        header.user = Some(serde_json::to_value(&from.user).unwrap_or(serde_json::Value::Null));
        header
            .extra
            .push(("request_id".to_string(), serde_json::json!(id)));

        let bytes = frame::encode(&header, &payload)?;
        let recipient_ws = workspace_of(to_fqid);

        if let Err(e) = self.deliver(to_fqid, &recipient_ws, bytes, &header).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.method_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::TransportClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(RouterError::RequestTimeout)
            }
        }
    }

    /// Called by a peer-side consumer (a transport's reader task, or the
    /// synthetic workspace-manager dispatcher) once it has produced a
    /// response for a request it was routed.
    pub fn resolve_pending(&self, request_id: &str, result: RouterResult<serde_json::Value>) {
        if let Some((_, tx)) = self.pending.remove(request_id) {
            let _ = tx.send(result);
        }
    }

    pub fn method_timeout(&self) -> Duration {
        self.method_timeout
    }
}

fn extract_request_id(header: &FrameHeader) -> RouterResult<String> {
    header
        .extra
        .iter()
        .find(|(k, _)| k == "request_id")
        .and_then(|(_, v)| v.as_str().map(String::from))
        .ok_or(RouterError::MalformedFrame("no request_id".into()))
}

/// Rewrite a bare client-id into `sender_ws/client`; reject cross-workspace
/// addressing unless the sender belongs to the wildcard workspace `*`.
fn normalize_recipient(to: &str, sender_ws: &str) -> RouterResult<String> {
    if let Some((ws, _client)) = to.split_once('/') {
        if ws != sender_ws && sender_ws != "*" {
            return Err(RouterError::WorkspaceForbidden(format!(
                "cannot address {to} from workspace {sender_ws}"
            )));
        }
        return Ok(to.to_string());
    }
    Ok(format!("{sender_ws}/{to}"))
}

fn workspace_of(fqid: &str) -> String {
    fqid.split('/').next().unwrap_or_default().to_string()
}

fn client_segment(fqid: &str) -> String {
    let after_slash = fqid.split_once('/').map(|(_, rest)| rest).unwrap_or(fqid);
    after_slash.split(':').next().unwrap_or(after_slash).to_string()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::InProcessTransport;

    fn user(id: &str) -> UserIdentity {
        UserIdentity {
            id: id.into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        }
    }

    fn peer_in(ws: &str, client: &str) -> (Arc<Peer>, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let (t, rx) = InProcessTransport::new(8);
        (Arc::new(Peer::new(ws, client, user(client), t)), rx)
    }

    #[test]
    fn normalize_recipient_prefixes_bare_client() {
        assert_eq!(normalize_recipient("client-2", "ws-1").unwrap(), "ws-1/client-2");
    }

    #[test]
    fn normalize_recipient_rejects_cross_workspace() {
        assert!(normalize_recipient("ws-2/client-2", "ws-1").is_err());
    }

    #[test]
    fn normalize_recipient_allows_wildcard_sender() {
        assert!(normalize_recipient("ws-2/client-2", "*").is_ok());
    }

    #[tokio::test]
    async fn route_frame_delivers_to_local_peer() {
        let router = Router::new(Authenticator::new(None));
        let ws = router.workspaces.get_or_create("ws-1", &user("u1"), false);
        let (sender, _rx1) = peer_in("ws-1", "c1");
        let (recipient, mut rx2) = peer_in("ws-1", "c2");
        ws.insert_peer(sender.clone()).unwrap();
        ws.insert_peer(recipient).unwrap();

        let header = FrameHeader::new(sender.id(), "c2");
        let encoded = frame::encode(&header, b"payload").unwrap();
        router.route_frame(&sender, &encoded).await.unwrap();

        let received = rx2.recv().await.unwrap();
        let decoded = frame::decode(&received).unwrap();
        assert_eq!(decoded.header.to, "ws-1/c2");
        assert_eq!(decoded.header.ws.as_deref(), Some("ws-1"));
        assert_eq!(decoded.payload, b"payload");
    }

    #[tokio::test]
    async fn route_frame_to_unknown_recipient_errors() {
        let router = Router::new(Authenticator::new(None));
        let ws = router.workspaces.get_or_create("ws-1", &user("u1"), false);
        let (sender, _rx) = peer_in("ws-1", "c1");
        ws.insert_peer(sender.clone()).unwrap();

        let header = FrameHeader::new(sender.id(), "ghost");
        let encoded = frame::encode(&header, b"").unwrap();
        let result = router.route_frame(&sender, &encoded).await;
        assert!(matches!(result, Err(RouterError::RecipientUnknown(_))));
    }

    #[tokio::test]
    async fn call_times_out_when_no_one_answers() {
        let router = Router::with_timeout(Authenticator::new(None), Duration::from_millis(20));
        let ws = router.workspaces.get_or_create("ws-1", &user("u1"), false);
        let (caller, _rx1) = peer_in("ws-1", "c1");
        let (_callee, _rx2) = peer_in("ws-1", "c2");
        ws.insert_peer(caller.clone()).unwrap();
        ws.insert_peer(_callee).unwrap();

        let result = router.call(&caller, "ws-1/c2", "echo", serde_json::json!("hi")).await;
        assert!(matches!(result, Err(RouterError::RequestTimeout)));
    }

    #[tokio::test]
    async fn call_resolves_when_callee_answers() {
        let router = Router::new(Authenticator::new(None));
        let ws = router.workspaces.get_or_create("ws-1", &user("u1"), false);
        let (caller, _rx1) = peer_in("ws-1", "c1");
        let (callee, mut rx2) = peer_in("ws-1", "c2");
        ws.insert_peer(caller.clone()).unwrap();
        ws.insert_peer(callee).unwrap();

        let router2 = router.clone();
        let responder = tokio::spawn(async move {
            let raw = rx2.recv().await.unwrap();
            let decoded = frame::decode(&raw).unwrap();
            let req: RpcRequest = serde_json::from_slice(&decoded.payload).unwrap();
            router2.resolve_pending(&req.id, Ok(serde_json::json!("pong")));
        });

        let result = router.call(&caller, "ws-1/c2", "ping", serde_json::Value::Null).await;
        responder.await.unwrap();
        assert_eq!(result.unwrap(), serde_json::json!("pong"));
    }
}
