// SPDX-License-Identifier: MIT
//!
//! `conclave-router`: an in-process RPC and service-brokering fabric.
//! Workspaces scope peers and services; peers exchange length-prefixed
//! frames through a [`router::Router`] that dispatches by fully-qualified
//! `workspace/client[:service]` address; every workspace carries a
//! built-in workspace service (registration, discovery, tokens, logging,
//! events) reachable through the identical call path as any other
//! service. An optional [`cluster::ClusterCoordinator`] extends addressing
//! across a set of cooperating router processes, and [`http`] exposes the
//! fabric over WebSocket and a plain REST proxy.

pub mod auth;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod http;
pub mod peer;
pub mod router;
pub mod service;
pub mod workspace;
pub mod workspace_service;

pub use auth::{Authenticator, UserIdentity};
pub use config::RouterConfig;
pub use error::{RouterError, RouterResult};
pub use router::Router;
pub use workspace::{Workspace, WorkspaceRegistry};
