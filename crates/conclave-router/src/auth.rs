// SPDX-License-Identifier: MIT
//!
//! Authentication: shared-secret JWTs, opaque one-shot tokens, and the
//! anonymous fallback.
//!
//! Three paths, in the order the handshake tries them (see
//! [`Authenticator::authenticate`]):
//! 1. A configured `jwt_secret` lets the router verify (and mint) HS256
//!    JWTs carrying [`TokenClaims`].
//! 2. A token minted locally by [`Authenticator::generate_token`] when no
//!    secret is configured is stored as an *opaque* entry in a bounded,
//!    scan-on-insert table (see [`Authenticator::evict_expired`]) and
//!    looked up by value.
//! 3. No token at all: the caller is anonymous, with a freshly generated
//!    stable id, role `anonymous`, and scope `read`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RouterError, RouterResult};

/// Maximum number of opaque tokens kept in the table at once. On each
/// insert the table is scanned for a bounded number of expired entries to
/// evict — see the "token table growth" design note.
const OPAQUE_TABLE_SCAN_BUDGET: usize = 32;

/// Resolved identity of an authenticated (or anonymous) caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
    pub is_anonymous: bool,
}

impl UserIdentity {
    pub fn anonymous() -> Self {
        Self {
            id: format!("anon-{}", Uuid::new_v4()),
            email: None,
            roles: vec!["anonymous".to_string()],
            scopes: vec!["read".to_string()],
            is_anonymous: true,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin") || self.has_role("root")
    }
}

/// Claims carried by a token, shared-secret JWT or opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub workspace: Option<String>,
    pub client_id: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

impl TokenClaims {
    pub fn user(&self) -> UserIdentity {
        UserIdentity {
            id: self.sub.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            scopes: self.scopes.clone(),
            is_anonymous: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp < Utc::now().timestamp()
    }
}

/// Recognized `generate_token` configuration (spec §4.C).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateTokenConfig {
    pub user_id: Option<String>,
    pub workspace: Option<String>,
    pub client_id: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Seconds from now. Defaults to 3600 if omitted.
    pub expires_in: Option<i64>,
}

/// What the handshake or HTTP bearer-token layer resolved.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub user: UserIdentity,
    pub requested_workspace: Option<String>,
    pub requested_client_id: Option<String>,
}

struct OpaqueEntry {
    claims: TokenClaims,
}

/// Shared authentication state: the configured JWT secret (if any) and the
/// opaque-token table.
pub struct Authenticator {
    jwt_secret: Option<String>,
    opaque_tokens: DashMap<String, OpaqueEntry>,
}

impl Authenticator {
    pub fn new(jwt_secret: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            jwt_secret,
            opaque_tokens: DashMap::new(),
        })
    }

    pub fn jwt_enabled(&self) -> bool {
        self.jwt_secret.is_some()
    }

    /// Authenticate an inbound handshake/HTTP bearer token. `None` means no
    /// token was presented — resolves to anonymous.
    pub fn authenticate(&self, token: Option<&str>) -> RouterResult<AuthOutcome> {
        let Some(token) = token else {
            return Ok(AuthOutcome {
                user: UserIdentity::anonymous(),
                requested_workspace: None,
                requested_client_id: None,
            });
        };

        let claims = self.verify_any(token)?;
        if claims.is_expired() {
            return Err(RouterError::ExpiredToken);
        }
        Ok(AuthOutcome {
            user: claims.user(),
            requested_workspace: claims.workspace.clone(),
            requested_client_id: claims.client_id.clone(),
        })
    }

    fn verify_any(&self, token: &str) -> RouterResult<TokenClaims> {
        if self.jwt_enabled() {
            if let Ok(claims) = self.verify_jwt(token) {
                return Ok(claims);
            }
        }
        self.lookup_opaque(token)
    }

    pub fn verify_jwt(&self, token: &str) -> RouterResult<TokenClaims> {
        let secret = self.jwt_secret.as_deref().ok_or(RouterError::InvalidToken)?;
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => RouterError::ExpiredToken,
            _ => RouterError::InvalidToken,
        })?;
        Ok(data.claims)
    }

    fn lookup_opaque(&self, token: &str) -> RouterResult<TokenClaims> {
        self.opaque_tokens
            .get(token)
            .map(|entry| entry.claims.clone())
            .ok_or(RouterError::InvalidToken)
    }

    /// Mint a token for `caller`. Requesting an identity/workspace other
    /// than the caller's own is only permitted when the caller is an admin.
    pub fn generate_token(
        &self,
        cfg: GenerateTokenConfig,
        caller: &UserIdentity,
        caller_workspace: &str,
    ) -> RouterResult<String> {
        let target_user = cfg.user_id.clone().unwrap_or_else(|| caller.id.clone());
        let target_workspace = cfg
            .workspace
            .clone()
            .unwrap_or_else(|| caller_workspace.to_string());

        let impersonating = target_user != caller.id || target_workspace != caller_workspace;
        if impersonating && !caller.is_admin() {
            return Err(RouterError::InsufficientScope);
        }

        let now = Utc::now();
        let ttl = cfg.expires_in.unwrap_or(3600);
        let claims = TokenClaims {
            sub: target_user,
            email: cfg.email,
            roles: cfg.roles,
            scopes: cfg.scopes,
            workspace: Some(target_workspace),
            client_id: cfg.client_id,
            iat: now.timestamp(),
            exp: now.timestamp() + ttl,
        };

        if self.jwt_enabled() {
            self.mint_jwt(&claims)
        } else {
            Ok(self.store_opaque(claims))
        }
    }

    fn mint_jwt(&self, claims: &TokenClaims) -> RouterResult<String> {
        let secret = self.jwt_secret.as_deref().ok_or(RouterError::InvalidToken)?;
        encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|_| RouterError::InvalidToken)
    }

    fn store_opaque(&self, claims: TokenClaims) -> String {
        self.evict_expired(&claims);
        let token = generate_opaque_token();
        self.opaque_tokens.insert(token.clone(), OpaqueEntry { claims });
        token
    }

    /// Scan up to [`OPAQUE_TABLE_SCAN_BUDGET`] entries and drop expired
    /// ones. Called on every insert so the table self-trims without a
    /// background sweep task; the scan budget bounds the cost of each
    /// insert regardless of table size.
    fn evict_expired(&self, fresh: &TokenClaims) {
        let now = Utc::now().timestamp();
        let mut scanned = 0usize;
        let mut expired = Vec::new();
        for entry in self.opaque_tokens.iter() {
            if scanned >= OPAQUE_TABLE_SCAN_BUDGET {
                break;
            }
            scanned += 1;
            if entry.value().claims.exp < now {
                expired.push(entry.key().clone());
            }
        }
        for key in expired {
            self.opaque_tokens.remove(&key);
        }
        let _ = fresh;
    }

    #[cfg(test)]
    pub fn opaque_table_len(&self) -> usize {
        self.opaque_tokens.len()
    }

    #[cfg(test)]
    pub fn insert_opaque_for_test(&self, token: &str, claims: TokenClaims) {
        self.opaque_tokens
            .insert(token.to_string(), OpaqueEntry { claims });
    }
}

fn generate_opaque_token() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str, workspace: &str, roles: Vec<&str>) -> TokenClaims {
        let now = Utc::now();
        TokenClaims {
            sub: sub.to_string(),
            email: None,
            roles: roles.into_iter().map(String::from).collect(),
            scopes: vec![],
            workspace: Some(workspace.to_string()),
            client_id: None,
            iat: now.timestamp(),
            exp: now.timestamp() + 3600,
        }
    }

    #[test]
    fn no_token_resolves_to_anonymous() {
        let auth = Authenticator::new(None);
        let outcome = auth.authenticate(None).unwrap();
        assert!(outcome.user.is_anonymous);
        assert!(outcome.user.has_role("anonymous"));
    }

    #[test]
    fn jwt_round_trip() {
        let auth = Authenticator::new(Some("secret".to_string()));
        let token = auth
            .generate_token(
                GenerateTokenConfig {
                    user_id: Some("alice".into()),
                    workspace: Some("default".into()),
                    roles: vec!["researcher".into()],
                    ..Default::default()
                },
                &UserIdentity {
                    id: "admin-1".into(),
                    email: None,
                    roles: vec!["admin".into()],
                    scopes: vec![],
                    is_anonymous: false,
                },
                "default",
            )
            .unwrap();

        let outcome = auth.authenticate(Some(&token)).unwrap();
        assert_eq!(outcome.user.id, "alice");
        assert_eq!(outcome.requested_workspace.as_deref(), Some("default"));
    }

    #[test]
    fn non_admin_cannot_mint_token_for_other_user() {
        let auth = Authenticator::new(Some("secret".to_string()));
        let caller = UserIdentity {
            id: "bob".into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        };
        let result = auth.generate_token(
            GenerateTokenConfig {
                user_id: Some("alice".into()),
                ..Default::default()
            },
            &caller,
            "bob-ws",
        );
        assert!(matches!(result, Err(RouterError::InsufficientScope)));
    }

    #[test]
    fn non_admin_can_mint_token_for_self() {
        let auth = Authenticator::new(Some("secret".to_string()));
        let caller = UserIdentity {
            id: "bob".into(),
            email: None,
            roles: vec![],
            scopes: vec![],
            is_anonymous: false,
        };
        let result = auth.generate_token(GenerateTokenConfig::default(), &caller, "bob-ws");
        assert!(result.is_ok());
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let auth = Authenticator::new(Some("secret".to_string()));
        let mut c = claims("alice", "default", vec![]);
        c.exp = Utc::now().timestamp() - 10;
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &c,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let result = auth.authenticate(Some(&token));
        assert!(matches!(result, Err(RouterError::ExpiredToken)));
    }

    #[test]
    fn opaque_token_used_when_no_secret_configured() {
        let auth = Authenticator::new(None);
        let token = auth
            .generate_token(
                GenerateTokenConfig {
                    workspace: Some("default".into()),
                    ..Default::default()
                },
                &UserIdentity::anonymous(),
                "anon-ws",
            )
            .unwrap();
        let outcome = auth.authenticate(Some(&token)).unwrap();
        assert_eq!(outcome.requested_workspace.as_deref(), Some("default"));
    }

    #[test]
    fn unknown_opaque_token_is_invalid() {
        let auth = Authenticator::new(None);
        assert!(matches!(
            auth.authenticate(Some("not-a-real-token")),
            Err(RouterError::InvalidToken)
        ));
    }

    #[test]
    fn opaque_table_evicts_expired_entries_on_insert() {
        let auth = Authenticator::new(None);
        let mut expired = claims("u1", "ws", vec![]);
        expired.exp = Utc::now().timestamp() - 100;
        auth.insert_opaque_for_test("expired-token", expired);
        assert_eq!(auth.opaque_table_len(), 1);

        // Any subsequent insert scans and evicts expired entries.
        let _ = auth.generate_token(GenerateTokenConfig::default(), &UserIdentity::anonymous(), "ws");
        assert_eq!(auth.opaque_table_len(), 1, "only the fresh token should remain");
    }

    #[test]
    fn anonymous_identities_are_unique() {
        let a = UserIdentity::anonymous();
        let b = UserIdentity::anonymous();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn admin_role_recognizes_root_alias() {
        let u = UserIdentity {
            id: "x".into(),
            email: None,
            roles: vec!["root".into()],
            scopes: vec![],
            is_anonymous: false,
        };
        assert!(u.is_admin());
    }

}
