// SPDX-License-Identifier: MIT
//!
//! Optional horizontal scale-out (4.I): the `ClusterStore` trait documents
//! the interface this crate consumes against an external coordination
//! service (Redis/etcd/whatever an operator wires up); `ClusterCoordinator`
//! implements the heartbeat/registration/forward/broadcast/cleanup
//! responsibilities against it. Re-expressed from the teacher's
//! `sven-node::p2p::handler` libp2p allowlist + periodic-task + request/
//! response shape against this documented store interface instead of a
//! concrete swarm, per Design Note "dynamic dispatch"/"global registries"
//! and because `spec.md` §1 treats the store as an external collaborator.
//!
//! The in-memory [`InMemoryClusterStore`] below exists for tests and
//! single-process demos only — it is not production guidance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};
use crate::frame;
use crate::router::Router;

pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_S: u64 = 60;
pub const DEFAULT_SERVER_TTL_S: u64 = 90;

/// Contract expected from the external coordination store (4.I): atomic
/// key set/get/expire, key-set membership with expiry, and publish/
/// subscribe. `delete` removes a single scalar key (one set via `set`/
/// `set_with_ttl`); it does not touch set membership created via
/// `add_to_set` — those entries age out on their own.
///
/// `set_with_ttl` and `add_to_set` entries are expected to self-expire:
/// `get` must return `None` and `members` must omit a member once its TTL
/// has elapsed, without requiring a separate sweep to evict it (a real
/// store TTLs the key/member natively; the in-memory store below filters
/// at read time). `ClusterCoordinator`'s own cleanup pass builds on this —
/// it reaps a sibling router's heartbeat and client-ownership keys once
/// they're stale, but leaves its entry in `cluster:active_servers` itself
/// to this self-expiry rather than requiring a set-member-removal
/// primitive this trait doesn't otherwise need.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn set(&self, key: &str, value: String) -> RouterResult<()>;
    async fn get(&self, key: &str) -> RouterResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> RouterResult<()>;
    async fn delete(&self, key: &str) -> RouterResult<()>;
    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> RouterResult<()>;
    async fn members(&self, set_key: &str) -> RouterResult<Vec<String>>;
    async fn publish(&self, channel: &str, message: String) -> RouterResult<()>;
    async fn subscribe(&self, channel: &str) -> RouterResult<broadcast::Receiver<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ForwardMessage {
    target_client: String,
    /// base64-encoded frame bytes.
    message: String,
    from_server: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BroadcastMessage {
    channel: String,
    message: String,
    from_server: String,
}

/// Drives heartbeat/registration/forward/broadcast/cleanup against a
/// `ClusterStore`. Holds a `Weak<Router>` back-reference so delivering a
/// forwarded frame to a local peer doesn't create a reference cycle with
/// the `Router` that owns this coordinator.
pub struct ClusterCoordinator {
    store: Arc<dyn ClusterStore>,
    server_id: String,
    router: Weak<Router>,
    active: AtomicBool,
    heartbeat_interval: Duration,
    cleanup_interval: Duration,
    server_ttl: Duration,
}

impl ClusterCoordinator {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        server_id: impl Into<String>,
        router: Weak<Router>,
        heartbeat_interval: Duration,
        cleanup_interval: Duration,
        server_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            server_id: server_id.into(),
            router,
            active: AtomicBool::new(true),
            heartbeat_interval,
            cleanup_interval,
            server_ttl,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn server_channel(&self) -> String {
        format!("cluster:channel:{}", self.server_id)
    }

    /// Spawn the heartbeat, cleanup, and inbound-forward-subscription
    /// background tasks. Returns immediately; tasks run for the lifetime
    /// of the returned `Arc<Self>` (they hold a clone of it).
    pub fn spawn(self: &Arc<Self>, host: &str, port: u16) {
        self.clone().spawn_heartbeat(host.to_string(), port);
        self.clone().spawn_cleanup();
        self.clone().spawn_forward_listener();
    }

    fn spawn_heartbeat(self: Arc<Self>, host: String, port: u16) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.heartbeat_interval);
            loop {
                interval.tick().await;
                if !self.is_active() {
                    return;
                }
                let payload = serde_json::json!({
                    "host": host,
                    "port": port,
                    "last_seen": Utc::now().timestamp(),
                });
                let ttl = self.server_ttl;
                let key = format!("cluster:servers:{}", self.server_id);
                if let Err(e) = self.store.set_with_ttl(&key, payload.to_string(), ttl).await {
                    warn!(error = %e, "cluster heartbeat failed; disabling coordinator");
                    self.active.store(false, Ordering::Release);
                    return;
                }
                let _ = self
                    .store
                    .add_to_set("cluster:active_servers", &self.server_id, ttl)
                    .await;
            }
        });
    }

    fn spawn_cleanup(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cleanup_interval);
            loop {
                interval.tick().await;
                if !self.is_active() {
                    return;
                }
                let members = match self.store.members("cluster:active_servers").await {
                    Ok(members) => members,
                    Err(e) => {
                        warn!(error = %e, "cluster store unavailable during cleanup");
                        self.active.store(false, Ordering::Release);
                        return;
                    }
                };
                for server_id in members {
                    if server_id == self.server_id {
                        continue;
                    }
                    if let Err(e) = self.reap_if_stale(&server_id).await {
                        warn!(error = %e, server = %server_id, "cluster cleanup failed for a sibling router");
                    }
                }
            }
        });
    }

    /// Remove `server_id` and GC the clients it owned if its last
    /// heartbeat is older than 3x the heartbeat interval. A server with no
    /// heartbeat entry left at all (already evicted by the store's own
    /// key TTL) is treated as stale outright.
    async fn reap_if_stale(&self, server_id: &str) -> RouterResult<()> {
        let stale_after = self.heartbeat_interval.saturating_mul(3).as_secs() as i64;
        let last_seen = match self.store.get(&format!("cluster:servers:{server_id}")).await? {
            Some(raw) => serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.get("last_seen").and_then(|n| n.as_i64()))
                .unwrap_or(0),
            None => 0,
        };
        if Utc::now().timestamp() - last_seen < stale_after {
            return Ok(());
        }

        let clients_key = format!("cluster:servers:{server_id}:clients");
        for fqid in self.store.members(&clients_key).await? {
            if let Some((ws, client_id)) = fqid.split_once('/') {
                self.store.delete(&client_key(ws, client_id)).await?;
            }
        }
        // The membership set itself (`clients_key`) is left to its own
        // per-member TTL rather than deleted outright — `delete` targets
        // single-value keys, not set keys, per the store contract above.
        self.store.delete(&format!("cluster:servers:{server_id}")).await?;
        debug!(server = %server_id, "reaped stale sibling router");
        Ok(())
    }

    fn spawn_forward_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            let channel = self.server_channel();
            let mut rx = match self.store.subscribe(&channel).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "could not subscribe to cluster forward channel");
                    self.active.store(false, Ordering::Release);
                    return;
                }
            };
            while let Ok(raw) = rx.recv().await {
                let Ok(fwd) = serde_json::from_str::<ForwardMessage>(&raw) else {
                    continue;
                };
                let Some(router) = self.router.upgrade() else {
                    return;
                };
                let Ok(bytes) = base64_decode(&fwd.message) else {
                    continue;
                };
                if let Err(e) = deliver_locally(&router, &fwd.target_client, bytes).await {
                    warn!(error = %e, target = %fwd.target_client, "failed to deliver forwarded frame");
                }
            }
        });
    }

    pub async fn register_client(&self, ws: &str, client_id: &str) -> RouterResult<()> {
        let ttl = self.server_ttl;
        self.store
            .set_with_ttl(&client_key(ws, client_id), self.server_id.clone(), ttl)
            .await?;
        self.store
            .add_to_set(&format!("cluster:servers:{}:clients", self.server_id), &format!("{ws}/{client_id}"), ttl)
            .await
    }

    pub async fn unregister_client(&self, ws: &str, client_id: &str) -> RouterResult<()> {
        self.store.delete(&client_key(ws, client_id)).await
    }

    pub async fn locate(&self, ws: &str, client_id: &str) -> RouterResult<Option<String>> {
        self.store.get(&client_key(ws, client_id)).await
    }

    /// Forward a frame addressed to `to_fqid` (`workspace/client`) owned by
    /// a sibling router.
    pub async fn forward(&self, to_fqid: &str, bytes: Vec<u8>) -> RouterResult<()> {
        if !self.is_active() {
            return Err(RouterError::StoreUnavailable);
        }
        let (ws, client_id) = to_fqid
            .split_once('/')
            .ok_or_else(|| RouterError::RecipientUnknown(to_fqid.to_string()))?;
        let owner = self
            .locate(ws, client_id)
            .await?
            .ok_or_else(|| RouterError::RecipientUnknown(to_fqid.to_string()))?;

        let fwd = ForwardMessage {
            target_client: to_fqid.to_string(),
            message: base64_encode(&bytes),
            from_server: self.server_id.clone(),
        };
        let body = serde_json::to_string(&fwd).map_err(|e| RouterError::ServiceError(e.to_string()))?;
        self.store.publish(&format!("cluster:channel:{owner}"), body).await
    }

    pub async fn broadcast(&self, channel: &str, message: String) -> RouterResult<()> {
        let payload = BroadcastMessage {
            channel: channel.to_string(),
            message,
            from_server: self.server_id.clone(),
        };
        let body = serde_json::to_string(&payload).map_err(|e| RouterError::ServiceError(e.to_string()))?;
        self.store.publish("cluster:broadcast", body).await
    }
}

async fn deliver_locally(router: &Arc<Router>, to_fqid: &str, bytes: Vec<u8>) -> RouterResult<()> {
    let (ws_id, client_id) = to_fqid
        .split_once('/')
        .ok_or_else(|| RouterError::RecipientUnknown(to_fqid.to_string()))?;
    let ws = router
        .workspaces
        .get(ws_id)
        .ok_or_else(|| RouterError::RecipientUnknown(to_fqid.to_string()))?;
    let peer = ws
        .get_peer(client_id)
        .ok_or_else(|| RouterError::RecipientUnknown(to_fqid.to_string()))?;
    // Frame arrives byte-identical except for the router-side header
    // rewrites already applied by the originating router before forwarding.
    let _ = frame::decode(&bytes)?;
    match peer.transport.send(bytes).await {
        crate::peer::SendOutcome::Sent => Ok(()),
        crate::peer::SendOutcome::QueueFull => Err(RouterError::BackpressureDrop),
        crate::peer::SendOutcome::Closed => Err(RouterError::TransportClosed),
    }
}

fn client_key(ws: &str, client_id: &str) -> String {
    format!("cluster:clients:{ws}:{client_id}")
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> RouterResult<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| RouterError::MalformedFrame(e.to_string()))
}

// ── In-memory test/demo store ───────────────────────────────────────────────

struct StoredValue {
    value: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// A `ClusterStore` backed by process memory. Useful for tests and
/// single-process demos of clustering; not production guidance — a real
/// deployment points this trait at Redis, etcd, or similar.
pub struct InMemoryClusterStore {
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, HashMap<String, chrono::DateTime<Utc>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryClusterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn is_live(expires_at: &Option<chrono::DateTime<Utc>>) -> bool {
        match expires_at {
            Some(t) => *t > Utc::now(),
            None => true,
        }
    }
}

impl Default for InMemoryClusterStore {
    fn default() -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn set(&self, key: &str, value: String) -> RouterResult<()> {
        self.values.insert(key.to_string(), StoredValue { value, expires_at: None });
        Ok(())
    }

    async fn get(&self, key: &str) -> RouterResult<Option<String>> {
        match self.values.get(key) {
            Some(v) if Self::is_live(&v.expires_at) => Ok(Some(v.value.clone())),
            Some(_) => {
                self.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> RouterResult<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> RouterResult<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> RouterResult<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.sets
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string(), expires_at);
        Ok(())
    }

    async fn members(&self, set_key: &str) -> RouterResult<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .sets
            .get(set_key)
            .map(|m| m.iter().filter(|(_, exp)| **exp > now).map(|(k, _)| k.clone()).collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: String) -> RouterResult<()> {
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0);
        let _ = tx.send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> RouterResult<broadcast::Receiver<String>> {
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0);
        Ok(tx.subscribe())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_round_trips() {
        let store = InMemoryClusterStore::new();
        store.set("k", "v".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        let store = InMemoryClusterStore::new();
        store
            .set_with_ttl("k", "v".to_string(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn members_excludes_expired() {
        let store = InMemoryClusterStore::new();
        store.add_to_set("s", "a", Duration::from_secs(60)).await.unwrap();
        store.add_to_set("s", "b", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let members = store.members("s").await.unwrap();
        assert_eq!(members, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn publish_subscribe_round_trip() {
        let store = InMemoryClusterStore::new();
        let mut rx = store.subscribe("c").await.unwrap();
        store.publish("c", "hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn forward_without_known_owner_is_recipient_unknown() {
        let store = InMemoryClusterStore::new();
        let router = Router::new(crate::auth::Authenticator::new(None));
        let coordinator = ClusterCoordinator::new(
            store,
            "r1",
            Arc::downgrade(&router),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(90),
        );
        let result = coordinator.forward("ws-a/c-b", vec![1, 2, 3]).await;
        assert!(matches!(result, Err(RouterError::RecipientUnknown(_))));
    }

    #[tokio::test]
    async fn register_then_locate_finds_owning_server() {
        let store = InMemoryClusterStore::new();
        let router = Router::new(crate::auth::Authenticator::new(None));
        let coordinator = ClusterCoordinator::new(
            store,
            "r1",
            Arc::downgrade(&router),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(90),
        );
        coordinator.register_client("ws-a", "c-b").await.unwrap();
        assert_eq!(coordinator.locate("ws-a", "c-b").await.unwrap(), Some("r1".to_string()));
    }

    #[tokio::test]
    async fn reap_if_stale_removes_a_dead_servers_heartbeat_and_clients() {
        let store = InMemoryClusterStore::new();
        let router = Router::new(crate::auth::Authenticator::new(None));
        let coordinator = ClusterCoordinator::new(
            store.clone(),
            "r1",
            Arc::downgrade(&router),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(90),
        );

        // r2 registered a client and sent one heartbeat, then went dark.
        let stale_payload = serde_json::json!({"host": "10.0.0.2", "port": 9527, "last_seen": 0});
        store
            .set_with_ttl("cluster:servers:r2", stale_payload.to_string(), Duration::from_secs(3600))
            .await
            .unwrap();
        store
            .add_to_set("cluster:servers:r2:clients", "ws-a/c-b", Duration::from_secs(3600))
            .await
            .unwrap();
        store
            .set_with_ttl(&client_key("ws-a", "c-b"), "r2".to_string(), Duration::from_secs(3600))
            .await
            .unwrap();

        coordinator.reap_if_stale("r2").await.unwrap();

        assert_eq!(coordinator.locate("ws-a", "c-b").await.unwrap(), None);
        assert_eq!(store.get("cluster:servers:r2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reap_if_stale_leaves_a_recently_seen_server_alone() {
        let store = InMemoryClusterStore::new();
        let router = Router::new(crate::auth::Authenticator::new(None));
        let coordinator = ClusterCoordinator::new(
            store.clone(),
            "r1",
            Arc::downgrade(&router),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(90),
        );
        let fresh_payload = serde_json::json!({"host": "10.0.0.2", "port": 9527, "last_seen": Utc::now().timestamp()});
        store
            .set_with_ttl("cluster:servers:r2", fresh_payload.to_string(), Duration::from_secs(3600))
            .await
            .unwrap();

        coordinator.reap_if_stale("r2").await.unwrap();

        assert!(store.get("cluster:servers:r2").await.unwrap().is_some());
    }
}
