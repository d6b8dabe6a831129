// SPDX-License-Identifier: MIT
//!
//! Streaming serializer for lazy-sequence service results (4.H
//! "Streaming"): one JSON value per line, chunked transfer, a final
//! `{"type":"error",...}` line and stream close on mid-iteration failure.

use axum::body::{Body, Bytes};
use axum::http::{header, Response, StatusCode};
use futures::Stream;

use crate::error::RouterResult;

fn ndjson_lines<S>(inner: S) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>>
where
    S: Stream<Item = RouterResult<serde_json::Value>> + Send + 'static,
{
    async_stream::stream! {
        futures::pin_mut!(inner);
        use futures::StreamExt;
        while let Some(item) = inner.next().await {
            match item {
                Ok(value) => {
                    let mut line = serde_json::to_string(&value).unwrap_or_default();
                    line.push('\n');
                    yield Ok(Bytes::from(line));
                }
                Err(e) => {
                    let body = serde_json::json!({"type": "error", "error": e.to_string()});
                    let mut line = body.to_string();
                    line.push('\n');
                    yield Ok(Bytes::from(line));
                    break;
                }
            }
        }
    }
}

/// Build a `Content-Type: application/x-ndjson` streaming response from a
/// lazy sequence of results.
pub fn ndjson_response<S>(stream: S) -> Response<Body>
where
    S: Stream<Item = RouterResult<serde_json::Value>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ndjson_lines(stream)))
        .expect("static headers are always valid")
}
