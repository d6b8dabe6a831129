// SPDX-License-Identifier: MIT
//!
//! Per-workspace service registry (4.F).
//!
//! Only service *metadata* lives here — the callable members stay on the
//! owning [`crate::peer::Peer`] and are invoked by the router sending a
//! request frame to that peer's transport and correlating the reply, never
//! by a direct in-process function call. That holds even for the built-in
//! workspace service: it is "owned" by a synthetic peer whose transport
//! feeds an internal dispatcher (see `workspace_service.rs`), so the same
//! request/response path handles every service uniformly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::UserIdentity;
use crate::error::{RouterError, RouterResult};

/// Who may see a service in `list_services`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Protected,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Protected
    }
}

/// `type` field of a service descriptor: one of `generic`, `functions`,
/// `asgi`, or an opaque string supplied by the registering peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKind(pub String);

impl ServiceKind {
    pub const GENERIC: &'static str = "generic";
    pub const FUNCTIONS: &'static str = "functions";
    pub const ASGI: &'static str = "asgi";

    pub fn generic() -> Self {
        ServiceKind(Self::GENERIC.to_string())
    }

    pub fn is_functions(&self) -> bool {
        self.0 == Self::FUNCTIONS
    }

    pub fn is_asgi(&self) -> bool {
        self.0 == Self::ASGI
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceKind {
    fn default() -> Self {
        Self::generic()
    }
}

impl From<&str> for ServiceKind {
    fn from(s: &str) -> Self {
        ServiceKind(s.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub require_context: bool,
    /// Filled in by the registry at registration time; ignored if supplied
    /// by the caller.
    #[serde(default)]
    pub workspace: String,
    /// Set true to replace an existing descriptor with the same id owned
    /// by the same peer.
    #[serde(default, skip_serializing)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service-local id: no `:` or `/`.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub config: ServiceConfig,
    /// Fully-qualified id (`workspace/client`) of the owning peer.
    pub owner: String,
    /// Introspected member names, for `GET /{ws}/services/{sid}`.
    #[serde(default)]
    pub members: Vec<String>,
}

impl ServiceDescriptor {
    /// Fully-qualified service id: `workspace/client:service`.
    pub fn fqid(&self) -> String {
        format!("{}:{}", self.owner, self.id)
    }

    fn validate_id(id: &str) -> RouterResult<()> {
        if id.is_empty() || id.contains(':') || id.contains('/') {
            return Err(RouterError::ServiceError(format!(
                "invalid service id: {id:?}"
            )));
        }
        Ok(())
    }
}

/// Selection mode for `get_service` when more than one descriptor matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectMode {
    #[default]
    Default,
    Random,
}

/// Query fields accepted by `list_services`/`get_service`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceQuery {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub app_id: Option<String>,
    pub visibility: Option<Visibility>,
}

impl ServiceQuery {
    fn matches(&self, d: &ServiceDescriptor) -> bool {
        if let Some(id) = &self.id {
            if &d.id != id {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if d.kind.as_str() != kind {
                return false;
            }
        }
        if let Some(app_id) = &self.app_id {
            // app_id is matched against the owner's client segment.
            if !d.owner.ends_with(app_id.as_str()) {
                return false;
            }
        }
        if let Some(v) = self.visibility {
            if d.config.visibility != v {
                return false;
            }
        }
        true
    }
}

/// Per-workspace metadata registry. Bound to a single workspace id at
/// construction; every descriptor it holds belongs to that workspace.
pub struct ServiceRegistry {
    workspace: String,
    descriptors: HashMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            descriptors: HashMap::new(),
        }
    }

    /// Register a descriptor on behalf of `owner` (fully-qualified peer
    /// id). `caller` is the owner's resolved identity, used for the
    /// admin-gate on `default`/`public` registration (invariant 5).
    pub fn register(
        &mut self,
        mut descriptor: ServiceDescriptor,
        owner: &str,
        caller: &UserIdentity,
    ) -> RouterResult<ServiceDescriptor> {
        ServiceDescriptor::validate_id(&descriptor.id)?;

        if is_reserved_workspace(&self.workspace) && !caller.is_admin() {
            return Err(RouterError::WorkspaceForbidden(format!(
                "registration in '{}' requires an admin role",
                self.workspace
            )));
        }

        descriptor.owner = owner.to_string();
        descriptor.config.workspace = self.workspace.clone();

        let fqid = descriptor.fqid();
        if let Some(existing) = self.descriptors.get(&fqid) {
            if existing.owner != owner {
                return Err(RouterError::ServiceIdInUse(fqid));
            }
            if !descriptor.config.overwrite {
                return Err(RouterError::ServiceIdInUse(fqid));
            }
        }

        self.descriptors.insert(fqid, descriptor.clone());
        Ok(descriptor)
    }

    /// Only the owning peer may unregister.
    pub fn unregister(&mut self, id: &str, owner: &str) -> RouterResult<()> {
        let fqid = Self::to_fqid(owner, id);
        match self.descriptors.get(&fqid) {
            Some(d) if d.owner == owner => {
                self.descriptors.remove(&fqid);
                Ok(())
            }
            Some(_) => Err(RouterError::WorkspaceForbidden(
                "only the owning peer may unregister this service".into(),
            )),
            None => Err(RouterError::ServiceNotFound(fqid)),
        }
    }

    /// Remove every service owned by `owner` (peer disconnect cleanup).
    pub fn remove_owner(&mut self, owner: &str) {
        self.descriptors.retain(|_, d| d.owner != owner);
    }

    fn to_fqid(owner: &str, id: &str) -> String {
        format!("{owner}:{id}")
    }

    /// List descriptors visible to `caller_workspace` (per invariant 1,
    /// membership in this registry's workspace is equivalent to the
    /// caller's own workspace equaling it).
    pub fn list(&self, query: &ServiceQuery, caller_workspace: &str) -> Vec<ServiceDescriptor> {
        let is_member = caller_workspace == self.workspace;
        self.descriptors
            .values()
            .filter(|d| d.config.visibility == Visibility::Public || is_member)
            .filter(|d| query.matches(d))
            .cloned()
            .collect()
    }

    /// Find descriptors matching a service-local id within this workspace
    /// (used by both `list` and the router's cross-workspace `get`).
    pub fn find_by_local_id(&self, id: &str) -> Vec<&ServiceDescriptor> {
        self.descriptors.values().filter(|d| d.id == id).collect()
    }

    pub fn get_by_fqid(&self, fqid: &str) -> Option<&ServiceDescriptor> {
        self.descriptors.get(fqid)
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

pub fn is_reserved_workspace(id: &str) -> bool {
    id == "default" || id == "public"
}

// ── Unit tests ────────────────────────────────────────────────────────────────
