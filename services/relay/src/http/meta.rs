//! Meta endpoints: replica health, documentary surface listing, and the
//! authorized client listing.

use crate::auth::Principal;
use crate::config::DirectoryMode;
use crate::directory::key_clients_key;
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse, Extension, Json};
use relay_protocol::{ClientInfo, HealthResponse};
use serde_json::json;
use std::collections::HashSet;
use tracing::warn;

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        replica_id: state.config.replica_id.clone(),
        clients: state.registry.len().await,
        directory_mode: state.config.directory_mode.as_str().to_owned(),
        directory_healthy: state.directory.healthy().await,
    })
}

/// GET /clients -- the caller's clients: local entries first, then ids the
/// directory attributes to the same key on other replicas.
pub async fn list_clients(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> impl IntoResponse {
    let mut seen = HashSet::new();
    let mut clients = Vec::new();
    for entry in state.registry.list_for(&principal.api_key_hash).await {
        seen.insert(entry.client_id.clone());
        clients.push(ClientInfo {
            client_id: entry.client_id.clone(),
            local: true,
            last_seen_ms: Some(entry.last_seen_ms()),
        });
    }

    if state.config.directory_mode == DirectoryMode::Shared {
        match state
            .directory
            .set_members(&key_clients_key(&principal.api_key_hash))
            .await
        {
            Ok(members) => {
                for client_id in members {
                    if seen.insert(client_id.clone()) {
                        clients.push(ClientInfo {
                            client_id,
                            local: false,
                            last_seen_ms: None,
                        });
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "directory listing failed, returning local clients only");
            }
        }
    }

    Json(json!({ "clients": clients }))
}

/// GET /api -- purely documentary description of the REST surface.
pub async fn api_index() -> impl IntoResponse {
    Json(json!({
        "websocket": { "path": "/relay", "hello": { "type": "hello", "clientId": "...", "apiKey": "...", "metadata": {} } },
        "authentication": { "header": "x-api-key" },
        "endpoints": [
            { "method": "GET",    "path": "/search",            "params": ["clientId", "query", "filter?"] },
            { "method": "GET",    "path": "/entity",            "params": ["clientId", "uuid"] },
            { "method": "POST",   "path": "/entity",            "body": ["clientId", "entityType", "data?"] },
            { "method": "PUT",    "path": "/entity",            "body": ["clientId", "uuid", "data?"] },
            { "method": "DELETE", "path": "/entity",            "params": ["clientId", "uuid"] },
            { "method": "GET",    "path": "/structure",         "params": ["clientId"] },
            { "method": "GET",    "path": "/contents",          "params": ["clientId", "path"] },
            { "method": "POST",   "path": "/roll",              "body": ["clientId", "formula", "flavor?"] },
            { "method": "GET",    "path": "/rolls",             "params": ["clientId", "limit?"] },
            { "method": "GET",    "path": "/sheet",             "params": ["clientId", "uuid", "format?", "tab?", "scale?"] },
            { "method": "GET",    "path": "/files",             "params": ["clientId", "path?"] },
            { "method": "GET",    "path": "/files/download",    "params": ["clientId", "path"] },
            { "method": "POST",   "path": "/files/upload",      "body": "json (fileData data URL) or raw binary; 250 MB max" },
            { "method": "GET",    "path": "/macros",            "params": ["clientId"] },
            { "method": "POST",   "path": "/macros/execute",    "body": ["clientId", "uuid|name", "args?"] },
            { "method": "POST",   "path": "/encounter/:action", "actions": ["start", "next-turn", "next-round", "previous-turn", "previous-round", "end", "add", "remove"] },
            { "method": "POST",   "path": "/select",            "body": ["clientId", "..."] },
            { "method": "GET",    "path": "/selected",          "params": ["clientId"] },
            { "method": "POST",   "path": "/execute-script",    "body": ["clientId", "script"] },
            { "method": "POST",   "path": "/dnd5e/use-item",    "body": ["clientId", "actorUuid", "itemUuid|itemName"] },
            { "method": "POST",   "path": "/dnd5e/apply-damage","body": ["clientId", "actorUuid", "amount", "damageType?"] },
            { "method": "POST",   "path": "/dnd5e/rest",        "body": ["clientId", "actorUuid", "restType?"] },
            { "method": "GET",    "path": "/clients" },
            { "method": "GET",    "path": "/health" }
        ]
    }))
}
