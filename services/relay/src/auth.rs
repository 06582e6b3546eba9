//! Auth/Quota hook.
//!
//! The relay core does not define key storage or quota accounting; it only
//! guarantees the hook runs exactly once per REST request, before routing,
//! and that a rejection short-circuits before any client work.  The
//! WebSocket join handshake authorizes through the same hook.

use crate::http::response;
use crate::router::FORWARDED_FROM;
use crate::state::AppState;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The authorized caller identity carried through the request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub api_key_hash: String,
}

/// A hook rejection: HTTP status plus message for the error envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthReject {
    pub status: u16,
    pub message: String,
}

impl AuthReject {
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ApiKeyAuth: Send + Sync {
    async fn authorize(&self, api_key: &str) -> Result<Principal, AuthReject>;
    async fn on_success(&self, principal: &Principal);
}

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

// ---------------------------------------------------------------------------
// Bundled implementations
// ---------------------------------------------------------------------------

/// Keys configured at boot; per-key request counters.
pub struct StaticKeyAuth {
    key_hashes: HashSet<String>,
    counters: RwLock<HashMap<String, u64>>,
}

impl StaticKeyAuth {
    pub fn new(keys: &[String]) -> Self {
        Self {
            key_hashes: keys.iter().map(|k| hash_api_key(k)).collect(),
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub async fn request_count(&self, api_key_hash: &str) -> u64 {
        self.counters
            .read()
            .await
            .get(api_key_hash)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ApiKeyAuth for StaticKeyAuth {
    async fn authorize(&self, api_key: &str) -> Result<Principal, AuthReject> {
        if api_key.is_empty() {
            return Err(AuthReject::unauthenticated("missing x-api-key header"));
        }
        let api_key_hash = hash_api_key(api_key);
        if !self.key_hashes.contains(&api_key_hash) {
            return Err(AuthReject::unauthenticated("unknown api key"));
        }
        Ok(Principal { api_key_hash })
    }

    async fn on_success(&self, principal: &Principal) {
        *self
            .counters
            .write()
            .await
            .entry(principal.api_key_hash.clone())
            .or_insert(0) += 1;
    }
}

/// Dev-mode hook: any non-empty key is accepted.  The hook still runs --
/// deployments that want an open relay supply this, they never bypass the
/// hook itself.
pub struct PermissiveAuth;

#[async_trait]
impl ApiKeyAuth for PermissiveAuth {
    async fn authorize(&self, api_key: &str) -> Result<Principal, AuthReject> {
        if api_key.is_empty() {
            return Err(AuthReject::unauthenticated("missing x-api-key header"));
        }
        Ok(Principal {
            api_key_hash: hash_api_key(api_key),
        })
    }

    async fn on_success(&self, _principal: &Principal) {}
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Runs the hook once per incoming REST request, before the routing layer.
/// `on_success` is skipped for forwarded requests so one caller request
/// increments quota counters exactly once across the fleet.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    match state.auth.authorize(&api_key).await {
        Ok(principal) => {
            if !req.headers().contains_key(FORWARDED_FROM) {
                state.auth.on_success(&principal).await;
            }
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(reject) => response::json_error(
            StatusCode::from_u16(reject.status).unwrap_or(StatusCode::UNAUTHORIZED),
            relay_protocol::error_codes::UNAUTHENTICATED,
            reject.message,
        ),
    }
}
