// SPDX-License-Identifier: MIT
//!
//! Layered YAML configuration (§6 recognized keys), deep-merged across a
//! fixed search path, mirroring the teacher's `config::load` search-path +
//! deep-merge implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOptions {
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    #[serde(default = "default_cleanup_interval_s")]
    pub cleanup_interval_s: u64,
    #[serde(default = "default_server_ttl_s")]
    pub server_ttl_s: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: default_heartbeat_interval_s(),
            cleanup_interval_s: default_cleanup_interval_s(),
            server_ttl_s: default_server_ttl_s(),
        }
    }
}

fn default_heartbeat_interval_s() -> u64 {
    30
}
fn default_cleanup_interval_s() -> u64 {
    60
}
fn default_server_ttl_s() -> u64 {
    90
}
fn default_method_timeout_s() -> u64 {
    60
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_backpressure_queue_depth() -> usize {
    crate::peer::InProcessTransport::DEFAULT_QUEUE_DEPTH
}

/// Recognized configuration keys (spec §6), plus the ambient HTTP-server
/// knobs (`bind_host`, `max_body_bytes`, `backpressure_queue_depth`) every
/// complete implementation of this kind of gateway carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub url: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub default_service: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub clustered: bool,
    pub server_id: Option<String>,
    #[serde(default)]
    pub cluster_options: ClusterOptions,
    #[serde(default = "default_method_timeout_s")]
    pub method_timeout_s: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_backpressure_queue_depth")]
    pub backpressure_queue_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            url: None,
            port: None,
            bind_host: default_bind_host(),
            jwt_secret: None,
            default_service: HashMap::new(),
            clustered: false,
            server_id: None,
            cluster_options: ClusterOptions::default(),
            method_timeout_s: default_method_timeout_s(),
            max_body_bytes: default_max_body_bytes(),
            backpressure_queue_depth: default_backpressure_queue_depth(),
        }
    }
}

impl RouterConfig {
    /// Resolve the effective bind port: `port` if set, else parsed out of
    /// `url`, else the protocol default 9527.
    pub fn resolve_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        self.url
            .as_deref()
            .and_then(|u| u.rsplit_once(':'))
            .and_then(|(_, p)| p.trim_end_matches('/').parse().ok())
            .unwrap_or(9527)
    }
}

/// Load and deep-merge YAML configuration across, in increasing priority:
/// `/etc/<app_name>/router.yaml`, `$XDG_CONFIG_HOME/<app_name>/router.yaml`,
/// `./.{app_name}/router.yaml`, and an explicit `--config` path.
pub fn load(app_name: &str, explicit_path: Option<&Path>) -> anyhow::Result<RouterConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    for path in search_paths(app_name, explicit_path) {
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        merge_yaml(&mut merged, parsed);
    }
    serde_yaml::from_value(merged).context("deserializing merged configuration")
}

fn search_paths(app_name: &str, explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("/etc/{app_name}/router.yaml"))];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join(app_name).join("router.yaml"));
    }
    paths.push(PathBuf::from(format!("./.{app_name}/router.yaml")));
    if let Some(explicit) = explicit {
        paths.push(explicit.to_path_buf());
    }
    paths
}

/// Recursively merge `overlay` into `base`; mapping keys from `overlay`
/// win, non-mapping values are replaced wholesale.
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recognized_values() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.method_timeout_s, 60);
        assert_eq!(cfg.cluster_options.heartbeat_interval_s, 30);
        assert_eq!(cfg.cluster_options.cleanup_interval_s, 60);
        assert_eq!(cfg.cluster_options.server_ttl_s, 90);
        assert!(!cfg.clustered);
    }

    #[test]
    fn resolve_port_prefers_explicit_port() {
        let mut cfg = RouterConfig::default();
        cfg.port = Some(8080);
        cfg.url = Some("https://example.com:9000".to_string());
        assert_eq!(cfg.resolve_port(), 8080);
    }

    #[test]
    fn resolve_port_falls_back_to_url() {
        let mut cfg = RouterConfig::default();
        cfg.url = Some("https://example.com:9000".to_string());
        assert_eq!(cfg.resolve_port(), 9000);
    }

    #[test]
    fn merge_yaml_overlays_nested_keys_without_clobbering_siblings() {
        let mut base = serde_yaml::from_str::<serde_yaml::Value>(
            "cluster_options:\n  heartbeat_interval_s: 30\n  cleanup_interval_s: 60\n",
        )
        .unwrap();
        let overlay =
            serde_yaml::from_str::<serde_yaml::Value>("cluster_options:\n  heartbeat_interval_s: 5\n").unwrap();
        merge_yaml(&mut base, overlay);
        let merged: RouterConfig = serde_yaml::from_value(base).unwrap();
        assert_eq!(merged.cluster_options.heartbeat_interval_s, 5);
        assert_eq!(merged.cluster_options.cleanup_interval_s, 60);
    }

    #[test]
    fn load_with_no_files_present_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere.yaml");
        let cfg = load("conclave-test-nonexistent-app", Some(&missing)).unwrap();
        assert_eq!(cfg.method_timeout_s, 60);
    }

    #[test]
    fn load_merges_an_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.yaml");
        std::fs::write(&path, "jwt_secret: s3cr3t\nport: 7000\n").unwrap();
        let cfg = load("conclave-test-app", Some(&path)).unwrap();
        assert_eq!(cfg.jwt_secret.as_deref(), Some("s3cr3t"));
        assert_eq!(cfg.port, Some(7000));
    }
}
