// SPDX-License-Identifier: MIT
//!
//! Peer transport contract and the `Peer` value the registries key on.
//!
//! A `Peer` is every authenticated entity with an open transport: a real
//! WebSocket connection, an in-process pseudo-peer (tests, the HTTP proxy's
//! impersonated caller), or the synthetic workspace-manager peer that hosts
//! the workspace service. All three speak through the same [`PeerTransport`]
//! contract so the router never special-cases any of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::mpsc;

use crate::auth::UserIdentity;

/// Outbound send outcome used by the router to decide backpressure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The transport's outbound queue is at its high-water mark.
    QueueFull,
    /// The transport is no longer open.
    Closed,
}

/// Contract every peer transport implements.
///
/// `send` never blocks indefinitely: a bounded outbound queue backs real
/// transports, and a full queue reports [`SendOutcome::QueueFull`] rather
/// than applying backpressure to the router's dispatcher task.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> SendOutcome;
    async fn close(&self, code: u16, reason: &str);
    fn is_open(&self) -> bool;
}

/// An in-process transport backed by a bounded channel.
///
/// Used for the workspace-manager pseudo-peer, unit/integration tests, and
/// any embedded worker that exchanges frames without going over a socket.
/// The paired [`mpsc::Receiver`] is handed to whatever task is responsible
/// for consuming outbound bytes (for a real peer this would forward them to
/// a socket write task; tests read it directly).
pub struct InProcessTransport {
    tx: mpsc::Sender<Vec<u8>>,
    open: AtomicBool,
}

impl InProcessTransport {
    /// High-water mark for the outbound queue before frames are dropped.
    pub const DEFAULT_QUEUE_DEPTH: usize = 256;

    pub fn new(queue_depth: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        (
            Arc::new(Self {
                tx,
                open: AtomicBool::new(true),
            }),
            rx,
        )
    }
}

#[async_trait::async_trait]
impl PeerTransport for InProcessTransport {
    async fn send(&self, bytes: Vec<u8>) -> SendOutcome {
        if !self.open.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(bytes) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::Release);
                SendOutcome::Closed
            }
        }
    }

    async fn close(&self, _code: u16, _reason: &str) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// An authenticated entity with an open transport, identified as
/// `workspace/client`.
pub struct Peer {
    pub workspace: String,
    pub client: String,
    pub user: UserIdentity,
    pub created_at: DateTime<Utc>,
    pub transport: Arc<dyn PeerTransport>,
    /// Service-local ids of services this peer owns.
    owned_services: DashSet<String>,
    /// Event names this peer subscribed to via the workspace service's
    /// `on`/`off` (4.G); checked by the transport delivering the
    /// workspace's event bus (`emit`) out to this peer.
    event_subscriptions: DashSet<String>,
}

impl Peer {
    pub fn new(
        workspace: impl Into<String>,
        client: impl Into<String>,
        user: UserIdentity,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            client: client.into(),
            user,
            created_at: Utc::now(),
            transport,
            owned_services: DashSet::new(),
            event_subscriptions: DashSet::new(),
        }
    }

    /// Fully-qualified id: `workspace/client`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.workspace, self.client)
    }

    pub fn add_owned_service(&self, service_id: &str) {
        self.owned_services.insert(service_id.to_string());
    }

    pub fn remove_owned_service(&self, service_id: &str) {
        self.owned_services.remove(service_id);
    }

    pub fn owned_service_ids(&self) -> Vec<String> {
        self.owned_services.iter().map(|s| s.clone()).collect()
    }

    pub fn subscribe_to_event(&self, event: &str) {
        self.event_subscriptions.insert(event.to_string());
    }

    pub fn unsubscribe_from_event(&self, event: &str) {
        self.event_subscriptions.remove(event);
    }

    pub fn is_subscribed_to_event(&self, event: &str) -> bool {
        self.event_subscriptions.contains(event)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
