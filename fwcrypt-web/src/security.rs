//! API key authentication.
//!
//! Keys are configured by SHA-256 digest only; the plaintext token never touches the
//! configuration file. Every request hashes the presented bearer token and looks it up
//! in the live [`ApiKeyStore`], so a revocation takes effect on the very next request.

use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;

/// Bind to localhost only unless configured otherwise.
pub fn bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Default upload limit: 64 MB.
pub const MAX_UPLOAD_SIZE: usize = 64 * 1024 * 1024;

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    ReadReports,
    SubmitJobs,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::ReadReports => "read_reports",
            Scope::SubmitJobs => "submit_jobs",
        }
    }
}

/// Configured API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,
    pub name: String,
    /// Lowercase hex SHA-256 of the bearer token
    pub token_sha256: String,
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub revoked: bool,
}

/// Digest under which a token is configured.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub key_id: String,
    pub name: String,
    pub scopes: Vec<Scope>,
}

impl Principal {
    /// # Errors
    /// `Forbidden` if the key lacks `scope`
    pub fn require(&self, scope: Scope) -> Result<(), ApiError> {
        if self.scopes.contains(&scope) {
            Ok(())
        } else {
            log::warn!("Key {} lacks scope {}", self.key_id, scope.as_str());
            Err(ApiError::forbidden(format!("API key lacks the {} scope", scope.as_str())))
        }
    }
}

#[derive(Debug, Default)]
pub struct ApiKeyStore {
    keys: RwLock<Vec<ApiKeyConfig>>,
}

impl ApiKeyStore {
    pub fn new(mut keys: Vec<ApiKeyConfig>) -> Self {
        for key in keys.iter_mut() {
            key.token_sha256 = key.token_sha256.trim().to_ascii_lowercase();
        }
        let active: usize = keys.iter().filter(|k| !k.revoked).count();
        log::info!("Loaded {} API keys ({} active)", keys.len(), active);
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Resolve an `Authorization` header value.
    ///
    /// # Errors
    /// `Unauthorized` if the header is missing, malformed, unknown or revoked
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, ApiError> {
        let header: &str = authorization.ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let token: &str = header
            .strip_prefix(BEARER_PREFIX)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::unauthorized("malformed Authorization header"))?;
        let digest: String = hash_token(token);

        let keys = self.keys.read();
        let key: &ApiKeyConfig = keys
            .iter()
            .find(|k| k.token_sha256 == digest)
            .ok_or_else(|| ApiError::unauthorized("unknown API key"))?;
        if key.revoked {
            log::warn!("Rejected revoked key {}", key.id);
            return Err(ApiError::unauthorized("API key has been revoked"));
        }
        Ok(Principal {
            key_id: key.id.clone(),
            name: key.name.clone(),
            scopes: key.scopes.clone(),
        })
    }

    /// Revoke a key. Returns `false` for an unknown id.
    pub fn revoke(&self, id: &str) -> bool {
        let mut keys = self.keys.write();
        match keys.iter_mut().find(|k| k.id == id) {
            Some(key) => {
                key.revoked = true;
                log::info!("Revoked API key {} ({})", key.id, key.name);
                true
            }
            None => false,
        }
    }

    /// Current key table, for persisting revocations.
    pub fn snapshot(&self) -> Vec<ApiKeyConfig> {
        self.keys.read().clone()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header: Option<&str> = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        state.keys.authenticate(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApiKeyStore {
        ApiKeyStore::new(vec![ApiKeyConfig {
            id: "prod".to_string(),
            name: "Production Key".to_string(),
            token_sha256: hash_token("bb_live_sk_1234").to_uppercase(),
            scopes: vec![Scope::ReadReports],
            revoked: false,
        }])
    }

    #[test]
    fn test_authenticate() {
        let keys = store();
        let principal = keys.authenticate(Some("Bearer bb_live_sk_1234")).unwrap();
        assert_eq!(principal.key_id, "prod");
        assert!(principal.require(Scope::ReadReports).is_ok());
        assert_eq!(principal.require(Scope::SubmitJobs).unwrap_err().code, "Forbidden");
    }

    #[test]
    fn test_rejections() {
        let keys = store();
        for header in [None, Some("bb_live_sk_1234"), Some("Bearer "), Some("Bearer wrong")] {
            assert_eq!(keys.authenticate(header).unwrap_err().code, "Unauthorized");
        }
    }

    #[test]
    fn test_revocation_is_immediate() {
        let keys = store();
        assert!(keys.authenticate(Some("Bearer bb_live_sk_1234")).is_ok());
        assert!(keys.revoke("prod"));
        assert!(!keys.revoke("missing"));
        let err = keys.authenticate(Some("Bearer bb_live_sk_1234")).unwrap_err();
        assert_eq!(err.code, "Unauthorized");
        assert!(keys.snapshot()[0].revoked);
    }
}
