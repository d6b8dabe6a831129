// SPDX-License-Identifier: MIT
//!
//! The "gateway-app" contract (4.H): dispatch an HTTP sub-path into a
//! service whose `type` is `asgi` or `functions`. The service receives a
//! request descriptor and returns a response descriptor; both cross the
//! same request/response RPC path every other service call uses.
//!
//! Simplification (see `DESIGN.md`): the source protocol streams the
//! response body as successive chunks carrying a `more_body` flag. This
//! crate's wire layer is a single JSON request/response per `Router::call`
//! (4.A explicitly leaves RPC wire semantics above the frame level to "the
//! peer library"), so a gateway-app response is produced in one call; an
//! app wanting to stream should register as a plain service method
//! returning a lazy sequence instead, which `http::ndjson` already serves.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};
use crate::peer::Peer;
use crate::router::Router;

#[derive(Debug, Serialize)]
struct RequestDescriptor {
    #[serde(rename = "type")]
    kind: &'static str,
    method: String,
    path: String,
    query_string: String,
    headers: HashMap<String, String>,
    /// Base64-encoded request body.
    body: String,
}

#[derive(Debug, Deserialize)]
struct ResponseDescriptor {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Base64-encoded response body.
    #[serde(default)]
    body: String,
}

fn default_status() -> u16 {
    200
}

/// Invoke `service_fqid`'s gateway-app entry point (`handle_request`) with
/// an HTTP request descriptor and translate its response descriptor back
/// into an axum response.
pub async fn dispatch(
    router: &Arc<Router>,
    caller: &Peer,
    service_fqid: &str,
    method: &str,
    path: &str,
    query_string: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RouterResult<(StatusCode, HeaderMap, Bytes)> {
    use base64::Engine;
    let descriptor = RequestDescriptor {
        kind: "http",
        method: method.to_string(),
        path: path.to_string(),
        query_string: query_string.to_string(),
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect(),
        body: base64::engine::general_purpose::STANDARD.encode(&body),
    };
    let args = serde_json::to_value(&descriptor).map_err(|e| RouterError::ServiceError(e.to_string()))?;

    let result = router.call(caller, service_fqid, "handle_request", args).await?;
    let response: ResponseDescriptor =
        serde_json::from_value(result).map_err(|e| RouterError::ServiceError(format!("invalid app response: {e}")))?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out_headers = HeaderMap::new();
    for (k, v) in response.headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(k),
            axum::http::HeaderValue::try_from(v),
        ) {
            out_headers.insert(name, value);
        }
    }
    let out_body = base64::engine::general_purpose::STANDARD
        .decode(response.body)
        .map(Bytes::from)
        .unwrap_or_default();

    Ok((status, out_headers, out_body))
}
