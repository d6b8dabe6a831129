// SPDX-License-Identifier: MIT
//!
//! The built-in workspace service (4.G): `register_service`,
//! `unregister_service`, `list_services`, `get_service`, `generate_token`,
//! `echo`, `log`/`info`/`warning`/`error`, and `emit`/`on`/`off`.
//!
//! Hosted on a synthetic peer, `workspace/workspace-manager`, whose
//! transport is [`WorkspaceManagerTransport`] rather than a real socket:
//! delivering a request frame to it runs the method natively and resolves
//! the router's pending-call table directly, so every caller — a real
//! peer, a test harness, or the HTTP proxy — invokes it through the exact
//! same `Router::call` path used for any other service.
//!
//! `require_context = true` is implicit here: every method below receives
//! the router-verified [`CallContext`] and never trusts caller-supplied
//! fields for `ws`/`from`/identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::UserIdentity;
use crate::context::CallContext;
use crate::error::{RouterError, RouterResult};
use crate::frame;
use crate::peer::{Peer, PeerTransport, SendOutcome};
use crate::router::{RpcRequest, Router};
use crate::service::{ServiceDescriptor, ServiceQuery};
use crate::workspace::{Workspace, WORKSPACE_MANAGER_CLIENT_ID};

/// Install the workspace service onto `workspace` as its manager peer.
/// `default_service` is the config-supplied `default_service` map (§6):
/// extra constant members installed alongside the built-ins.
pub fn install_workspace_manager(
    router: Arc<Router>,
    workspace: Arc<Workspace>,
    default_service: HashMap<String, serde_json::Value>,
) -> RouterResult<()> {
    let transport = Arc::new(WorkspaceManagerTransport {
        router,
        workspace: workspace.clone(),
        default_service,
        open: AtomicBool::new(true),
    });
    let owner = workspace.owner.clone();
    let peer = Peer::new(workspace.id.clone(), WORKSPACE_MANAGER_CLIENT_ID, owner, transport);
    workspace.insert_peer(Arc::new(peer))
}

/// Install the workspace service on `workspace` if it isn't there yet.
/// Called wherever a workspace is first handed to a caller (the
/// WebSocket handshake, the HTTP proxy's impersonated-peer resolution)
/// so every workspace — not just `default`/`public` — ends up with one,
/// without requiring a separate startup pass over every workspace that
/// could ever be created on demand.
pub fn ensure_installed(router: &Arc<Router>, workspace: &Arc<Workspace>, default_service: &HashMap<String, serde_json::Value>) {
    if workspace.get_peer(WORKSPACE_MANAGER_CLIENT_ID).is_some() {
        return;
    }
    match install_workspace_manager(router.clone(), workspace.clone(), default_service.clone()) {
        Ok(()) | Err(RouterError::ClientIdInUse(_)) => {}
        Err(e) => warn!(workspace = %workspace.id, error = %e, "failed to install workspace manager"),
    }
}

/// Pseudo-transport backing the workspace-manager peer: `send` executes
/// the request in-process instead of writing to a socket.
struct WorkspaceManagerTransport {
    router: Arc<Router>,
    workspace: Arc<Workspace>,
    default_service: HashMap<String, serde_json::Value>,
    open: AtomicBool,
}

#[async_trait::async_trait]
impl PeerTransport for WorkspaceManagerTransport {
    async fn send(&self, bytes: Vec<u8>) -> SendOutcome {
        let decoded = match frame::decode(&bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "workspace service received an unroutable frame");
                return SendOutcome::Sent;
            }
        };
        let req: RpcRequest = match serde_json::from_slice(&decoded.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "workspace service received a malformed request");
                return SendOutcome::Sent;
            }
        };

        let user: UserIdentity = decoded
            .header
            .user
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(UserIdentity::anonymous);

        let ctx = CallContext::new(
            self.workspace.id.clone(),
            decoded.header.from.clone(),
            decoded.header.to.clone(),
            user,
        );

        let result = dispatch(&self.router, &self.workspace, &req, &ctx, &self.default_service).await;
        self.router.resolve_pending(&req.id, result);
        SendOutcome::Sent
    }

    async fn close(&self, _code: u16, _reason: &str) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

fn canonicalize(method: &str) -> &str {
    match method {
        "registerService" => "register_service",
        "unregisterService" => "unregister_service",
        "listServices" => "list_services",
        "getService" => "get_service",
        "generateToken" => "generate_token",
        other => other,
    }
}

async fn dispatch(
    router: &Arc<Router>,
    workspace: &Arc<Workspace>,
    req: &RpcRequest,
    ctx: &CallContext,
    default_service: &HashMap<String, serde_json::Value>,
) -> RouterResult<serde_json::Value> {
    match canonicalize(&req.method) {
        "register_service" => register_service(workspace, req.args.clone(), ctx).await,
        "unregister_service" => unregister_service(workspace, &req.args, ctx).await,
        "list_services" => list_services(workspace, &req.args, ctx).await,
        "get_service" => get_service(router, &req.args, ctx).await,
        "generate_token" => generate_token(router, &req.args, ctx).await,
        "echo" => Ok(req.args.clone()),
        "log" | "info" => {
            info!(ws = %ctx.ws, from = %ctx.from, message = %stringify(&req.args), "workspace log");
            Ok(serde_json::Value::Null)
        }
        "warning" => {
            warn!(ws = %ctx.ws, from = %ctx.from, message = %stringify(&req.args), "workspace log");
            Ok(serde_json::Value::Null)
        }
        "error" => {
            error!(ws = %ctx.ws, from = %ctx.from, message = %stringify(&req.args), "workspace log");
            Ok(serde_json::Value::Null)
        }
        "emit" => emit(workspace, &req.args),
        "on" => subscribe(workspace, &req.args, ctx, true),
        "off" => subscribe(workspace, &req.args, ctx, false),
        other => default_service
            .get(other)
            .cloned()
            .ok_or_else(|| RouterError::FunctionNotFound(other.to_string())),
    }
}

fn stringify(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn register_service(
    workspace: &Arc<Workspace>,
    args: serde_json::Value,
    ctx: &CallContext,
) -> RouterResult<serde_json::Value> {
    let descriptor: ServiceDescriptor = serde_json::from_value(args)
        .map_err(|e| RouterError::ServiceError(format!("invalid descriptor: {e}")))?;
    let registered = workspace.register_service(descriptor, &ctx.from, &ctx.user).await?;
    serde_json::to_value(registered).map_err(|e| RouterError::ServiceError(e.to_string()))
}

async fn unregister_service(
    workspace: &Arc<Workspace>,
    args: &serde_json::Value,
    ctx: &CallContext,
) -> RouterResult<serde_json::Value> {
    let id = args
        .as_str()
        .ok_or_else(|| RouterError::ServiceError("unregister_service expects a service id string".into()))?;
    workspace.unregister_service(id, &ctx.from).await?;
    Ok(serde_json::Value::Null)
}

async fn list_services(
    workspace: &Arc<Workspace>,
    args: &serde_json::Value,
    ctx: &CallContext,
) -> RouterResult<serde_json::Value> {
    let query: ServiceQuery = if args.is_null() {
        ServiceQuery::default()
    } else {
        serde_json::from_value(args.clone())
            .map_err(|e| RouterError::ServiceError(format!("invalid query: {e}")))?
    };
    let listed = workspace.list_services(&query, &ctx.ws).await;
    serde_json::to_value(listed).map_err(|e| RouterError::ServiceError(e.to_string()))
}

/// Resolves the flexible id forms 4.F describes: bare, `client:service`, or
/// `workspace/client:service`. Returns the resolved fully-qualified
/// descriptor — the "remote-call handle" is simply that fqid, which the
/// caller subsequently passes to `Router::call` to invoke members.
async fn get_service(
    router: &Arc<Router>,
    args: &serde_json::Value,
    ctx: &CallContext,
) -> RouterResult<serde_json::Value> {
    let id = args
        .get("id")
        .and_then(|v| v.as_str())
        .or_else(|| args.as_str())
        .ok_or_else(|| RouterError::ServiceError("get_service requires an id".into()))?;

    if id.starts_with('*') {
        return Err(RouterError::WorkspaceForbidden(
            "wildcard lookup across workspaces is rejected".into(),
        ));
    }

    let mode = args
        .get("options")
        .and_then(|o| o.get("mode"))
        .and_then(|m| m.as_str())
        .unwrap_or("default");

    let descriptor = if let Some((ws_part, rest)) = split_workspace_qualified(id) {
        let ws = router
            .workspaces
            .get(ws_part)
            .ok_or_else(|| RouterError::ServiceNotFound(id.to_string()))?;
        if let Some((_client, service)) = rest.split_once(':') {
            select_candidate(&ws, service, mode).await?
        } else {
            select_candidate(&ws, rest, mode).await?
        }
    } else if let Some((client, service)) = id.split_once(':') {
        let ws = router
            .workspaces
            .get(&ctx.ws)
            .ok_or_else(|| RouterError::ServiceNotFound(id.to_string()))?;
        let fqid = format!("{}/{}:{}", ctx.ws, client, service);
        ws.get_by_fqid(&fqid)
            .await
            .ok_or_else(|| RouterError::ServiceNotFound(fqid))?
    } else {
        let ws = router
            .workspaces
            .get(&ctx.ws)
            .ok_or_else(|| RouterError::ServiceNotFound(id.to_string()))?;
        select_candidate(&ws, id, mode).await?
    };

    serde_json::to_value(descriptor).map_err(|e| RouterError::ServiceError(e.to_string()))
}

fn split_workspace_qualified(id: &str) -> Option<(&str, &str)> {
    let slash = id.find('/')?;
    let colon = id.find(':')?;
    if slash < colon {
        Some((&id[..slash], &id[slash + 1..]))
    } else {
        None
    }
}

/// Resolve a bare service-local id within `ws`, applying the `mode`
/// selection rule: `default` picks the first match; `random` takes a
/// uniform pick over a snapshot of the current candidate set (Design Note
/// ii — a race with a concurrent register/unregister is simply not
/// observed by this call, which is the natural consequence of `find`
/// being taken under the workspace's single registry lock).
async fn select_candidate(ws: &Arc<Workspace>, service_id: &str, mode: &str) -> RouterResult<ServiceDescriptor> {
    let candidates = ws.find_by_local_id(service_id).await;
    if candidates.is_empty() {
        return Err(RouterError::ServiceNotFound(service_id.to_string()));
    }
    if mode == "random" {
        use rand::Rng;
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[idx].clone())
    } else {
        Ok(candidates[0].clone())
    }
}

fn emit(workspace: &Arc<Workspace>, args: &serde_json::Value) -> RouterResult<serde_json::Value> {
    let event = args
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RouterError::ServiceError("emit requires an 'event' field".into()))?;
    let payload = args.get("payload").cloned().unwrap_or(serde_json::Value::Null);
    workspace.publish(event, payload);
    Ok(serde_json::Value::Null)
}

/// Record (`on`) or clear (`off`) the calling peer's interest in `event`
/// on the workspace's event bus. The actual delivery of a subsequently
/// `emit`ted event happens on the peer's own transport, which checks
/// `Peer::is_subscribed_to_event` against every event it receives off
/// `Workspace::subscribe()` (see `http::ws`'s writer task).
fn subscribe(
    workspace: &Arc<Workspace>,
    args: &serde_json::Value,
    ctx: &CallContext,
    wants_subscribed: bool,
) -> RouterResult<serde_json::Value> {
    let event = args
        .get("event")
        .and_then(|v| v.as_str())
        .or_else(|| args.as_str())
        .ok_or_else(|| RouterError::ServiceError("on/off requires an 'event' field".into()))?;
    let client_id = ctx
        .from
        .rsplit_once('/')
        .map(|(_, client)| client)
        .unwrap_or(ctx.from.as_str());
    if let Some(peer) = workspace.get_peer(client_id) {
        if wants_subscribed {
            peer.subscribe_to_event(event);
        } else {
            peer.unsubscribe_from_event(event);
        }
    }
    Ok(serde_json::Value::Null)
}

async fn generate_token(
    router: &Arc<Router>,
    args: &serde_json::Value,
    ctx: &CallContext,
) -> RouterResult<serde_json::Value> {
    use crate::auth::GenerateTokenConfig;
    let cfg: GenerateTokenConfig = serde_json::from_value(args.clone())
        .map_err(|e| RouterError::ServiceError(format!("invalid generate_token config: {e}")))?;
    let token = router.auth.generate_token(cfg, &ctx.user, &ctx.ws)?;
    Ok(serde_json::Value::String(token))
}
