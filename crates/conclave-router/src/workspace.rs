// SPDX-License-Identifier: MIT
//!
//! Workspace lifecycle and the workspace registry (4.E).
//!
//! Each [`Workspace`] owns its member peers, its own
//! [`crate::service::ServiceRegistry`] behind a `tokio::sync::Mutex`, and a
//! `broadcast` event bus — the per-workspace serialization point called
//! for in §5, generalized from the teacher's single `ControlService` task
//! per agent to one registry-guarding mutex per workspace.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::auth::UserIdentity;
use crate::error::{RouterError, RouterResult};
use crate::peer::Peer;
use crate::service::{is_reserved_workspace, ServiceDescriptor, ServiceQuery, ServiceRegistry};

/// Client-id of the synthetic peer hosting the workspace service (4.G).
pub const WORKSPACE_MANAGER_CLIENT_ID: &str = "workspace-manager";

const EVENT_BUS_CAPACITY: usize = 256;

/// An event published on a workspace's bus (`emit`/`on`/`off`, 4.G).
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// A naming and access-control domain for peers and services (§3).
pub struct Workspace {
    pub id: String,
    pub owner: UserIdentity,
    pub created_at: DateTime<Utc>,
    /// Never destroyed by the "last peer disconnects" rule — true for
    /// `default`, `public`, and workspaces created from a persistent token.
    pub persistent: bool,
    peers: DashMap<String, Arc<Peer>>,
    services: Mutex<ServiceRegistry>,
    events: broadcast::Sender<WorkspaceEvent>,
}

impl Workspace {
    pub fn new(id: impl Into<String>, owner: UserIdentity, persistent: bool) -> Arc<Self> {
        let id = id.into();
        let (events, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Arc::new(Self {
            services: Mutex::new(ServiceRegistry::new(id.clone())),
            persistent: persistent || is_reserved_workspace(&id),
            id,
            owner,
            created_at: Utc::now(),
            peers: DashMap::new(),
            events,
        })
    }

    pub fn is_reserved(&self) -> bool {
        is_reserved_workspace(&self.id)
    }

    /// Record a new peer. Fails with `ClientIdInUse` if the requested
    /// client-id is already taken.
    pub fn insert_peer(&self, peer: Arc<Peer>) -> RouterResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.peers.entry(peer.client.clone()) {
            Entry::Occupied(_) => Err(RouterError::ClientIdInUse(peer.id())),
            Entry::Vacant(v) => {
                v.insert(peer);
                Ok(())
            }
        }
    }

    pub fn get_peer(&self, client_id: &str) -> Option<Arc<Peer>> {
        self.peers.get(client_id).map(|p| p.clone())
    }

    /// Remove a peer and release every service it owned. Returns the
    /// removed peer, if any.
    pub async fn remove_peer(&self, client_id: &str) -> Option<Arc<Peer>> {
        let removed = self.peers.remove(client_id).map(|(_, p)| p);
        if let Some(peer) = &removed {
            let fqid = peer.id();
            self.services.lock().await.remove_owner(&fqid);
        }
        removed
    }

    /// Member peers excluding the synthetic workspace-manager peer —
    /// the count rule 6 destruction decisions are based on.
    pub fn real_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|e| e.key() != WORKSPACE_MANAGER_CLIENT_ID)
            .count()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn publish(&self, event: impl Into<String>, payload: serde_json::Value) {
        // No receivers is not an error: emit is fire-and-forget.
        let _ = self.events.send(WorkspaceEvent {
            event: event.into(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events.subscribe()
    }

    pub async fn register_service(
        &self,
        descriptor: ServiceDescriptor,
        owner_fqid: &str,
        caller: &UserIdentity,
    ) -> RouterResult<ServiceDescriptor> {
        self.services.lock().await.register(descriptor, owner_fqid, caller)
    }

    pub async fn unregister_service(&self, id: &str, owner_fqid: &str) -> RouterResult<()> {
        self.services.lock().await.unregister(id, owner_fqid)
    }

    pub async fn list_services(
        &self,
        query: &ServiceQuery,
        caller_workspace: &str,
    ) -> Vec<ServiceDescriptor> {
        self.services.lock().await.list(query, caller_workspace)
    }

    pub async fn find_by_local_id(&self, id: &str) -> Vec<ServiceDescriptor> {
        self.services
            .lock()
            .await
            .find_by_local_id(id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn get_by_fqid(&self, fqid: &str) -> Option<ServiceDescriptor> {
        self.services.lock().await.get_by_fqid(fqid).cloned()
    }
}

/// Maps workspace-id → [`Workspace`] and implements the handshake
/// creation rules (4.E).
pub struct WorkspaceRegistry {
    workspaces: DashMap<String, Arc<Workspace>>,
}

impl WorkspaceRegistry {
    /// `default` and `public` are pre-created, public, persistent (§3).
    pub fn new() -> Self {
        let registry = Self {
            workspaces: DashMap::new(),
        };
        let system = UserIdentity {
            id: "system".to_string(),
            email: None,
            roles: vec!["admin".to_string()],
            scopes: vec![],
            is_anonymous: false,
        };
        registry
            .workspaces
            .insert("default".to_string(), Workspace::new("default", system.clone(), true));
        registry
            .workspaces
            .insert("public".to_string(), Workspace::new("public", system, true));
        registry
    }

    pub fn get(&self, id: &str) -> Option<Arc<Workspace>> {
        self.workspaces.get(id).map(|w| w.clone())
    }

    pub fn get_or_create(&self, id: &str, owner: &UserIdentity, persistent: bool) -> Arc<Workspace> {
        self.workspaces
            .entry(id.to_string())
            .or_insert_with(|| Workspace::new(id, owner.clone(), persistent))
            .clone()
    }

    /// Resolve the workspace a new connection should join, per 4.E rules
    /// 1-4.
    ///
    /// `token_workspace` is the workspace claim carried by the presented
    /// token, if any — naming one there is itself the proof of entitlement
    /// (the grant happened when the token was minted, see 4.C's
    /// admin-only cross-user/workspace `generate_token` gate). `requested`
    /// is the workspace named in the handshake's own `workspace` field,
    /// independent of any token. A workspace requested without that proof
    /// is only honored for `default`/`public`, the anonymous caller's own
    /// workspace, or an admin caller; otherwise it is rejected with
    /// `WorkspaceForbidden` rather than falling through to rules 2-4 — a
    /// workspace WAS named, it's just not one this caller may use.
    pub fn resolve_for_handshake(
        &self,
        token_workspace: Option<&str>,
        requested: Option<&str>,
        user: &UserIdentity,
    ) -> RouterResult<Arc<Workspace>> {
        if let Some(ws) = token_workspace {
            return Ok(self.get_or_create(ws, user, false));
        }
        if let Some(ws) = requested {
            if is_reserved_workspace(ws) || ws == user.id || user.is_admin() {
                return Ok(self.get_or_create(ws, user, false));
            }
            return Err(RouterError::WorkspaceForbidden(format!(
                "{} may not join workspace '{ws}'",
                user.id
            )));
        }
        if user.is_anonymous {
            return Ok(self.get_or_create(&user.id, user, false));
        }
        if user.is_admin() {
            return Ok(self.get_or_create("default", user, true));
        }
        Err(RouterError::WorkspaceRequired)
    }

    /// Rule 6: destroy a non-persistent workspace once its last real peer
    /// disconnects.
    pub fn destroy_if_empty(&self, id: &str) {
        if let Some(ws) = self.get(id) {
            if !ws.persistent && ws.real_peer_count() == 0 {
                self.workspaces.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.workspaces.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for WorkspaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::InProcessTransport;

    fn admin() -> UserIdentity {
        UserIdentity {
            id: "root".into(),
            email: None,
            roles: vec!["admin".into()],
            scopes: vec![],
            is_anonymous: false,
        }
    }

    fn make_peer(ws: &str, client: &str, user: UserIdentity) -> Arc<Peer> {
        let (t, _rx) = InProcessTransport::new(8);
        Arc::new(Peer::new(ws, client, user, t))
    }

    #[test]
    fn default_and_public_preexist_and_are_persistent() {
        let registry = WorkspaceRegistry::new();
        assert!(registry.get("default").unwrap().persistent);
        assert!(registry.get("public").unwrap().persistent);
    }

    #[test]
    fn anonymous_gets_own_workspace_named_after_user_id() {
        let registry = WorkspaceRegistry::new();
        let user = UserIdentity::anonymous();
        let ws = registry.resolve_for_handshake(None, None, &user).unwrap();
        assert_eq!(ws.id, user.id);
        assert!(!ws.persistent);
    }

    #[test]
    fn admin_with_no_requested_workspace_gets_default() {
        let registry = WorkspaceRegistry::new();
        let ws = registry.resolve_for_handshake(None, None, &admin()).unwrap();
        assert_eq!(ws.id, "default");
    }

    #[test]
    fn plain_user_with_no_requested_workspace_is_rejected() {
        let registry = WorkspaceRegistry::new();
        let user = UserIdentity {
            id: "bob".into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        };
        let result = registry.resolve_for_handshake(None, None, &user);
        assert!(matches!(result, Err(RouterError::WorkspaceRequired)));
    }

    #[test]
    fn token_granted_workspace_is_created_on_demand() {
        let registry = WorkspaceRegistry::new();
        let user = UserIdentity {
            id: "bob".into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        };
        let ws = registry
            .resolve_for_handshake(Some("team-rocket"), None, &user)
            .unwrap();
        assert_eq!(ws.id, "team-rocket");
        assert!(registry.get("team-rocket").is_some());
    }

    #[test]
    fn plain_user_requesting_an_unrelated_workspace_is_forbidden() {
        let registry = WorkspaceRegistry::new();
        let user = UserIdentity {
            id: "bob".into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        };
        let result = registry.resolve_for_handshake(None, Some("someone-elses-ws"), &user);
        assert!(matches!(result, Err(RouterError::WorkspaceForbidden(_))));
    }

    #[test]
    fn anonymous_requesting_a_protected_workspace_is_forbidden() {
        let registry = WorkspaceRegistry::new();
        let user = UserIdentity::anonymous();
        let result = registry.resolve_for_handshake(None, Some("protected-ws"), &user);
        assert!(matches!(result, Err(RouterError::WorkspaceForbidden(_))));
    }

    #[test]
    fn client_id_collision_is_rejected() {
        let ws = Workspace::new("ws-1", admin(), false);
        ws.insert_peer(make_peer("ws-1", "c1", admin())).unwrap();
        let result = ws.insert_peer(make_peer("ws-1", "c1", admin()));
        assert!(matches!(result, Err(RouterError::ClientIdInUse(_))));
    }

    #[tokio::test]
    async fn workspace_destroyed_when_last_real_peer_disconnects() {
        let registry = WorkspaceRegistry::new();
        let user = UserIdentity {
            id: "bob".into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        };
        let ws = registry.resolve_for_handshake(Some("ephemeral"), None, &user).unwrap();
        ws.insert_peer(make_peer("ephemeral", "c1", user.clone())).unwrap();
        ws.remove_peer("c1").await;
        registry.destroy_if_empty("ephemeral");
        assert!(registry.get("ephemeral").is_none());
    }

    #[tokio::test]
    async fn default_workspace_survives_emptying() {
        let registry = WorkspaceRegistry::new();
        let ws = registry.get("default").unwrap();
        ws.insert_peer(make_peer("default", "c1", admin())).unwrap();
        ws.remove_peer("c1").await;
        registry.destroy_if_empty("default");
        assert!(registry.get("default").is_some());
    }

    #[test]
    fn manager_peer_does_not_count_toward_real_peer_count() {
        let ws = Workspace::new("ws-1", admin(), false);
        ws.insert_peer(make_peer("ws-1", WORKSPACE_MANAGER_CLIENT_ID, admin()))
            .unwrap();
        assert_eq!(ws.real_peer_count(), 0);
    }

    #[tokio::test]
    async fn event_bus_delivers_to_subscriber() {
        let ws = Workspace::new("ws-1", admin(), false);
        let mut rx = ws.subscribe();
        ws.publish("client_connected", serde_json::json!({"client_id": "c1"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "client_connected");
    }
}
