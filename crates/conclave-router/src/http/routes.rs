// SPDX-License-Identifier: MIT
//!
//! HTTP proxy (4.H): REST access to services without a live WebSocket
//! connection. Every route here resolves an impersonated [`Peer`] for the
//! HTTP caller (anonymous unless a valid bearer token is presented — an
//! invalid or missing `Authorization` header degrades to anonymous rather
//! than failing the request, per §4.H) and performs the call through the
//! same [`Router::call`] path a WebSocket peer would use.
//!
//! Per-IP rate limiting on authentication failures (ambient hardening,
//! not named by the distilled spec) is implemented with `governor`'s
//! keyed GCRA limiter, the same crate and pattern the teacher's gateway
//! uses for its own request throttling.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::UserIdentity;
use crate::error::{RouterError, RouterResult};
use crate::peer::{InProcessTransport, Peer};
use crate::router::Router;
use crate::workspace::WORKSPACE_MANAGER_CLIENT_ID;

use super::gateway_app;
use super::security::security_headers_mw;

pub struct AppState {
    pub router: Arc<Router>,
    auth_failure_limiter: DefaultKeyedRateLimiter<IpAddr>,
}

impl AppState {
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        // 10 failed-auth attempts per minute per source IP before further
        // attempts from that IP are rejected outright.
        let quota = Quota::per_minute(NonZeroU32::new(10).unwrap());
        Arc::new(Self {
            router,
            auth_failure_limiter: RateLimiter::keyed(quota),
        })
    }
}

/// Build the REST proxy routes. Does not attach `state` yet — the caller
/// (`http::build_app`) adds the `/ws` upgrade route, which shares the same
/// state type, before finalizing with `.with_state(...)`.
///
/// `max_body_bytes` enforces the configured request body ceiling before a
/// handler ever sees the bytes; a request-level `tracing` span (method,
/// path, status, latency) is attached to every call via `TraceLayer`.
pub fn build_router(max_body_bytes: usize) -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/health", get(health))
        .route("/{ws}/services", get(list_services))
        .route("/{ws}/services/{sid}", get(get_service))
        .route(
            "/{ws}/services/{sid}/{method}",
            get(call_service_method).post(call_service_method),
        )
        .route("/{ws}/apps/{sid}/{*path}", any(app_passthrough))
        .layer(axum::middleware::from_fn(security_headers_mw))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"success": true, "status": "ok"}))
}

async fn list_services(
    State(state): State<Arc<AppState>>,
    Path(ws): Path<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let caller = match resolve_caller(&state, &ws, &headers, addr.ip()).await {
        Ok(c) => c,
        Err(r) => return r,
    };
    match state
        .router
        .call(&caller, &format!("{ws}/workspace-manager"), "list_services", Value::Null)
        .await
    {
        Ok(v) => Json(serde_json::json!({"success": true, "services": v})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_service(
    State(state): State<Arc<AppState>>,
    Path((ws, sid)): Path<(String, String)>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let caller = match resolve_caller(&state, &ws, &headers, addr.ip()).await {
        Ok(c) => c,
        Err(r) => return r,
    };
    match state
        .router
        .call(
            &caller,
            &format!("{ws}/workspace-manager"),
            "get_service",
            serde_json::json!(sid),
        )
        .await
    {
        Ok(v) => Json(serde_json::json!({"success": true, "service": v})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn call_service_method(
    State(state): State<Arc<AppState>>,
    Path((ws, sid, method)): Path<(String, String, String)>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method_verb: Method,
    body: axum::body::Bytes,
) -> Response {
    let caller = match resolve_caller(&state, &ws, &headers, addr.ip()).await {
        Ok(c) => c,
        Err(r) => return r,
    };

    let mut params: HashMap<String, Value> =
        query.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    if method_verb == Method::POST && !body.is_empty() {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&body) {
            for (k, v) in map {
                params.insert(k, v);
            }
        }
    }

    let args = match params.len() {
        0 => Value::Null,
        1 => params.into_values().next().unwrap(),
        _ => Value::Object(params.into_iter().collect()),
    };

    let to = match resolve_service_recipient(&state.router, &ws, &sid).await {
        Ok(to) => to,
        Err(e) => return error_response(&e),
    };
    match state.router.call(&caller, &to, &method, args).await {
        Ok(v) => {
            if let Value::Array(items) = v {
                return super::ndjson::ndjson_response(futures::stream::iter(items.into_iter().map(Ok)))
                    .into_response();
            }
            Json(serde_json::json!({"success": true, "result": v})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Resolve an HTTP `{sid}` path segment to the fully-qualified peer id
/// (`workspace/client`) that actually owns it. A service's recipient is
/// its owning peer, not `sid` itself — `sid` is the service-local id a
/// `register_service` call chose, which may differ from the owning
/// peer's client id. `"ws"` is the well-known alias for the built-in
/// workspace-manager peer, which `list_services`/`get_service` reach
/// directly and which is never itself entered into the `ServiceRegistry`
/// (see `workspace_service::install_workspace_manager`), so it can't be
/// resolved through the registry lookup below.
async fn resolve_service_recipient(router: &Arc<Router>, ws: &str, sid: &str) -> RouterResult<String> {
    if sid == "ws" {
        return Ok(format!("{ws}/{WORKSPACE_MANAGER_CLIENT_ID}"));
    }
    let workspace = router
        .workspaces
        .get(ws)
        .ok_or_else(|| RouterError::ServiceNotFound(sid.to_string()))?;
    workspace
        .find_by_local_id(sid)
        .await
        .into_iter()
        .next()
        .map(|descriptor| descriptor.owner)
        .ok_or_else(|| RouterError::ServiceNotFound(sid.to_string()))
}

async fn app_passthrough(
    State(state): State<Arc<AppState>>,
    Path((ws, sid, path)): Path<(String, String, String)>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    RawQuery(query): RawQuery,
    body: axum::body::Bytes,
) -> Response {
    let caller = match resolve_caller(&state, &ws, &headers, addr.ip()).await {
        Ok(c) => c,
        Err(r) => return r,
    };
    let service_fqid = match resolve_service_recipient(&state.router, &ws, &sid).await {
        Ok(fqid) => fqid,
        Err(e) => return error_response(&e),
    };
    match gateway_app::dispatch(
        &state.router,
        &caller,
        &service_fqid,
        method.as_str(),
        &format!("/{path}"),
        query.as_deref().unwrap_or(""),
        &headers,
        body,
    )
    .await
    {
        Ok((status, resp_headers, resp_body)) => {
            let mut response = Response::builder().status(status);
            for (k, v) in resp_headers.iter() {
                response = response.header(k, v);
            }
            response.body(axum::body::Body::from(resp_body)).unwrap()
        }
        Err(e) => error_response(&e),
    }
}

/// Resolve the HTTP caller's identity into an impersonated, transient
/// in-process [`Peer`] scoped to `ws`. A missing or invalid bearer token
/// degrades to anonymous rather than failing the request (§4.H); an
/// IP address over its auth-failure budget is rejected with 429 before
/// the token is even inspected.
async fn resolve_caller(
    state: &Arc<AppState>,
    ws: &str,
    headers: &HeaderMap,
    ip: IpAddr,
) -> Result<Arc<Peer>, Response> {
    if state.auth_failure_limiter.check_key(&ip).is_err() {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"success": false, "detail": "too many authentication failures"})),
        )
            .into_response());
    }

    let token = bearer_token(headers);
    let user = match state.router.auth.authenticate(token.as_deref()) {
        Ok(outcome) => outcome.user,
        Err(_) => {
            if token.is_some() {
                let _ = state.auth_failure_limiter.check_key(&ip);
            }
            UserIdentity::anonymous()
        }
    };

    let workspace = state.router.workspaces.get_or_create(ws, &user, false);
    crate::workspace_service::ensure_installed(&state.router, &workspace, &state.router.default_service);
    let (transport, _rx) = InProcessTransport::new(crate::router::DEFAULT_BACKPRESSURE_LIMIT);
    let client_id = format!("http-{}", uuid::Uuid::new_v4());
    let peer = Arc::new(Peer::new(workspace.id.clone(), client_id, user, transport));
    Ok(peer)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn error_response(e: &RouterError) -> Response {
    (status_for(e), Json(serde_json::json!({"success": false, "detail": e.to_string()}))).into_response()
}

/// Map a [`RouterError`] to the HTTP status §6 assigns its class.
pub fn status_for(e: &RouterError) -> StatusCode {
    match e {
        RouterError::InvalidToken | RouterError::ExpiredToken => StatusCode::UNAUTHORIZED,
        RouterError::InsufficientScope | RouterError::WorkspaceForbidden(_) => StatusCode::FORBIDDEN,
        RouterError::ServiceNotFound(_) | RouterError::FunctionNotFound(_) | RouterError::RecipientUnknown(_) => {
            StatusCode::NOT_FOUND
        }
        RouterError::MalformedFrame(_) | RouterError::ServiceError(_) | RouterError::WorkspaceRequired => {
            StatusCode::BAD_REQUEST
        }
        RouterError::ClientIdInUse(_) | RouterError::ServiceIdInUse(_) => StatusCode::CONFLICT,
        RouterError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        RouterError::TransportClosed | RouterError::BackpressureDrop | RouterError::StoreUnavailable => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
