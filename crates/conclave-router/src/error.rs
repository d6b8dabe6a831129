// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Error kinds surfaced by the router, registries, and auth layer.
///
/// Each variant is propagated per the policy documented on the method that
/// returns it: handshake errors close the peer transport, per-frame errors
/// are turned into a synthesized error reply, HTTP errors map to a status
/// code (see `http::routes::status_for`).
#[derive(Debug, Error, Clone)]
pub enum RouterError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("insufficient scope for this operation")]
    InsufficientScope,

    #[error("a workspace is required and none could be determined")]
    WorkspaceRequired,

    #[error("workspace forbidden: {0}")]
    WorkspaceForbidden(String),

    #[error("client id already in use: {0}")]
    ClientIdInUse(String),

    #[error("service id already in use: {0}")]
    ServiceIdInUse(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("recipient unknown: {0}")]
    RecipientUnknown(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("request timed out")]
    RequestTimeout,

    #[error("dropped due to backpressure")]
    BackpressureDrop,

    #[error("cluster store unavailable")]
    StoreUnavailable,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("service call failed: {0}")]
    ServiceError(String),
}

impl RouterError {
    /// Stable string identifier for this error kind, used in error replies
    /// and HTTP error bodies (`detail` carries the human message separately).
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::InvalidToken => "InvalidToken",
            RouterError::ExpiredToken => "ExpiredToken",
            RouterError::InsufficientScope => "InsufficientScope",
            RouterError::WorkspaceRequired => "WorkspaceRequired",
            RouterError::WorkspaceForbidden(_) => "WorkspaceForbidden",
            RouterError::ClientIdInUse(_) => "ClientIdInUse",
            RouterError::ServiceIdInUse(_) => "ServiceIdInUse",
            RouterError::ServiceNotFound(_) => "ServiceNotFound",
            RouterError::FunctionNotFound(_) => "FunctionNotFound",
            RouterError::RecipientUnknown(_) => "RecipientUnknown",
            RouterError::TransportClosed => "TransportClosed",
            RouterError::RequestTimeout => "RequestTimeout",
            RouterError::BackpressureDrop => "BackpressureDrop",
            RouterError::StoreUnavailable => "StoreUnavailable",
            RouterError::MalformedFrame(_) => "MalformedFrame",
            RouterError::ServiceError(_) => "ServiceError",
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
