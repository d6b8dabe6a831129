// SPDX-License-Identifier: MIT
//!
//! Router-injected call context.
//!
//! When a service is registered with `require_context = true`, the router
//! appends a [`CallContext`] as the final argument of every invocation. The
//! context is built entirely from state the router itself verified — the
//! caller's frame-stamped `from`/`ws` and the peer's authenticated
//! [`UserIdentity`] — and is never taken from caller-supplied payload
//! fields, so a service can trust it even though it can't trust its other
//! arguments.

use serde::Serialize;

use crate::auth::UserIdentity;

/// Context the router attaches to a dispatched call.
#[derive(Debug, Clone, Serialize)]
pub struct CallContext {
    /// Workspace the call is scoped to.
    pub ws: String,
    /// Fully-qualified id (`workspace/client`) of the caller.
    pub from: String,
    /// Fully-qualified id (`workspace/client`) of the callee.
    pub to: String,
    /// Authenticated identity of the caller, as resolved at connect time.
    pub user: UserIdentity,
}

impl CallContext {
    pub fn new(ws: impl Into<String>, from: impl Into<String>, to: impl Into<String>, user: UserIdentity) -> Self {
        Self {
            ws: ws.into(),
            from: from.into(),
            to: to.into(),
            user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_serializes_with_expected_shape() {
        let ctx = CallContext::new("default", "default/client-1", "default/svc-1", UserIdentity::anonymous());
        let v = serde_json::to_value(&ctx).unwrap();
        assert_eq!(v["ws"], "default");
        assert_eq!(v["from"], "default/client-1");
        assert_eq!(v["to"], "default/svc-1");
        assert_eq!(v["user"]["is_anonymous"], true);
    }
}
