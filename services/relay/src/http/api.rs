//! REST Adapter: thin parameter extraction per endpoint, envelope assembly,
//! and the single correlated exchange shared by every client-targeted
//! route.
//!
//! Payloads stay opaque: a handler moves request fields into the outbound
//! envelope and relays the reply's payload object back as the HTTP body.
//! The only adapter-side content inspection is the script denylist and the
//! rendered-view post-processing, both deliberately outside the core.

use crate::correlator::Completion;
use crate::http::response;
use crate::registry::SendOutcome;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use relay_protocol::{kinds, Envelope};
use serde::Deserialize;
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Shared exchange
// ---------------------------------------------------------------------------

/// Run one correlated request against a local client and hand back the
/// reply envelope, or the finished error response.
///
/// The oneshot sink delivers exactly one of reply / timeout / client-gone,
/// so the HTTP response is written exactly once regardless of how the
/// request terminates.
pub(crate) async fn relay_exchange(
    state: &AppState,
    client_id: &str,
    kind: &'static str,
    message_type: &'static str,
    payload: Map<String, Value>,
) -> Result<Envelope, Response> {
    if state.registry.get(client_id).await.is_none() {
        return Err(response::client_not_found(client_id));
    }

    let deadline = state.config.timeout_for(kind);
    let (token, rx) = state.correlator.begin(client_id, kind, deadline).await;
    let envelope = Envelope::new(message_type)
        .with_request_id(token.clone())
        .with_payload(payload);

    match state.registry.send(client_id, envelope).await {
        SendOutcome::Ok => {}
        SendOutcome::NotFound => {
            state.correlator.cancel(&token).await;
            return Err(response::client_not_found(client_id));
        }
        SendOutcome::SendFailed => {
            state.correlator.cancel(&token).await;
            return Err(response::send_failed(
                "client outbound queue is full or its writer is stuck",
            ));
        }
    }

    match rx.await {
        Ok(Completion::Reply(reply)) => Ok(reply),
        Ok(Completion::Timeout) => Err(response::request_timeout(kind)),
        Ok(Completion::ClientGone) => Err(response::client_disconnected(&token)),
        Err(_) => Err(response::internal_error("correlation sink dropped")),
    }
}

pub(crate) async fn relay_request(
    state: &AppState,
    client_id: &str,
    kind: &'static str,
    message_type: &'static str,
    payload: Map<String, Value>,
) -> Response {
    match relay_exchange(state, client_id, kind, message_type, payload).await {
        Ok(reply) => (StatusCode::OK, Json(Value::Object(reply.payload))).into_response(),
        Err(resp) => resp,
    }
}

/// Split a JSON object body into the target client and the pass-through
/// payload (everything but `clientId`).
pub(crate) fn body_payload(body: &Value) -> Result<(String, Map<String, Value>), Response> {
    let Some(obj) = body.as_object() else {
        return Err(response::bad_request("expected a JSON object body"));
    };
    let client_id = obj
        .get("clientId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| response::bad_request("missing clientId"))?
        .to_owned();
    let mut payload = obj.clone();
    payload.remove("clientId");
    Ok((client_id, payload))
}

fn require_field(payload: &Map<String, Value>, field: &str) -> Result<(), Response> {
    if payload.contains_key(field) {
        Ok(())
    } else {
        Err(response::bad_request(format!("missing {field}")))
    }
}

// ---------------------------------------------------------------------------
// Search / entities / world structure
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    query: String,
    filter: Option<String>,
}

/// GET /search
pub async fn search(State(state): State<AppState>, Query(params): Query<SearchQuery>) -> Response {
    let mut payload = Map::new();
    payload.insert("query".to_owned(), json!(params.query));
    if let Some(filter) = params.filter {
        payload.insert("filter".to_owned(), json!(filter));
    }
    relay_request(
        &state,
        &params.client_id,
        kinds::SEARCH,
        "perform-search",
        payload,
    )
    .await
}

#[derive(Deserialize)]
pub struct EntityQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    uuid: String,
}

/// GET /entity
pub async fn get_entity(
    State(state): State<AppState>,
    Query(params): Query<EntityQuery>,
) -> Response {
    let mut payload = Map::new();
    payload.insert("uuid".to_owned(), json!(params.uuid));
    relay_request(&state, &params.client_id, kinds::ENTITY, "get-entity", payload).await
}

/// POST /entity
pub async fn create_entity(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_field(&payload, "entityType") {
        return resp;
    }
    relay_request(&state, &client_id, kinds::ENTITY, "create-entity", payload).await
}

/// PUT /entity
pub async fn update_entity(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_field(&payload, "uuid") {
        return resp;
    }
    relay_request(&state, &client_id, kinds::ENTITY, "update-entity", payload).await
}

/// DELETE /entity
pub async fn delete_entity(
    State(state): State<AppState>,
    Query(params): Query<EntityQuery>,
) -> Response {
    let mut payload = Map::new();
    payload.insert("uuid".to_owned(), json!(params.uuid));
    relay_request(
        &state,
        &params.client_id,
        kinds::ENTITY,
        "delete-entity",
        payload,
    )
    .await
}

#[derive(Deserialize)]
pub struct ClientTarget {
    #[serde(rename = "clientId")]
    client_id: String,
}

/// GET /structure
pub async fn get_structure(
    State(state): State<AppState>,
    Query(params): Query<ClientTarget>,
) -> Response {
    relay_request(
        &state,
        &params.client_id,
        kinds::STRUCTURE,
        "get-structure",
        Map::new(),
    )
    .await
}

#[derive(Deserialize)]
pub struct ContentsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    path: String,
}

/// GET /contents
pub async fn get_contents(
    State(state): State<AppState>,
    Query(params): Query<ContentsQuery>,
) -> Response {
    let mut payload = Map::new();
    payload.insert("path".to_owned(), json!(params.path));
    relay_request(
        &state,
        &params.client_id,
        kinds::CONTENTS,
        "get-contents",
        payload,
    )
    .await
}

// ---------------------------------------------------------------------------
// Dice
// ---------------------------------------------------------------------------

/// POST /roll
pub async fn roll(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_field(&payload, "formula") {
        return resp;
    }
    relay_request(&state, &client_id, kinds::ROLL, "perform-roll", payload).await
}

#[derive(Deserialize)]
pub struct RollHistoryQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    limit: Option<u32>,
}

/// GET /rolls
pub async fn roll_history(
    State(state): State<AppState>,
    Query(params): Query<RollHistoryQuery>,
) -> Response {
    let mut payload = Map::new();
    if let Some(limit) = params.limit {
        payload.insert("limit".to_owned(), json!(limit));
    }
    relay_request(&state, &params.client_id, kinds::ROLL, "get-rolls", payload).await
}

// ---------------------------------------------------------------------------
// Rendered views
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SheetQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    uuid: String,
    /// "html" returns the pre-processed document; anything else wraps the
    /// reply in JSON.
    format: Option<String>,
    tab: Option<String>,
    scale: Option<f32>,
}

/// GET /sheet
pub async fn get_sheet(State(state): State<AppState>, Query(params): Query<SheetQuery>) -> Response {
    let mut payload = Map::new();
    payload.insert("uuid".to_owned(), json!(params.uuid));
    if let Some(tab) = &params.tab {
        payload.insert("tab".to_owned(), json!(tab));
    }
    let reply = match relay_exchange(
        &state,
        &params.client_id,
        kinds::VIEW,
        "get-sheet-html",
        payload,
    )
    .await
    {
        Ok(reply) => reply,
        Err(resp) => return resp,
    };

    if params.format.as_deref() == Some("html") {
        if let Some(html) = reply.get_str("html") {
            return Html(render_sheet_html(html, params.tab.as_deref(), params.scale))
                .into_response();
        }
    }
    (StatusCode::OK, Json(Value::Object(reply.payload))).into_response()
}

/// Tab and scale hints pre-process the returned HTML; the document itself
/// is otherwise passed through untouched.
fn render_sheet_html(html: &str, tab: Option<&str>, scale: Option<f32>) -> String {
    let mut out = String::new();
    if let Some(scale) = scale {
        out.push_str(&format!(
            "<style>body{{transform:scale({scale});transform-origin:top left;}}</style>"
        ));
    }
    out.push_str(html);
    if let Some(tab) = tab {
        let tab: String = tab
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        out.push_str(&format!(
            "<script>document.querySelector('[data-tab=\"{tab}\"]')?.click();</script>"
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

/// GET /macros
pub async fn list_macros(
    State(state): State<AppState>,
    Query(params): Query<ClientTarget>,
) -> Response {
    relay_request(
        &state,
        &params.client_id,
        kinds::MACRO,
        "get-macros",
        Map::new(),
    )
    .await
}

/// POST /macros/execute
pub async fn execute_macro(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    if !payload.contains_key("uuid") && !payload.contains_key("name") {
        return response::bad_request("macro execution needs a uuid or a name");
    }
    relay_request(&state, &client_id, kinds::MACRO, "execute-macro", payload).await
}

// ---------------------------------------------------------------------------
// Encounters
// ---------------------------------------------------------------------------

const ENCOUNTER_ACTIONS: &[&str] = &[
    "start",
    "next-turn",
    "next-round",
    "previous-turn",
    "previous-round",
    "end",
    "add",
    "remove",
];

/// POST /encounter/:action
pub async fn encounter_control(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !ENCOUNTER_ACTIONS.contains(&action.as_str()) {
        return response::bad_request(format!("unknown encounter action {action}"));
    }
    let (client_id, mut payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    payload.insert("action".to_owned(), json!(action));
    relay_request(
        &state,
        &client_id,
        kinds::ENCOUNTER,
        "encounter-control",
        payload,
    )
    .await
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// POST /select
pub async fn select_entities(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    relay_request(&state, &client_id, kinds::SELECT, "select-entities", payload).await
}

/// GET /selected
pub async fn get_selected(
    State(state): State<AppState>,
    Query(params): Query<ClientTarget>,
) -> Response {
    relay_request(
        &state,
        &params.client_id,
        kinds::SELECT,
        "get-selected",
        Map::new(),
    )
    .await
}

// ---------------------------------------------------------------------------
// Script execution
// ---------------------------------------------------------------------------

/// Advisory denylist applied to script bodies before relaying.  Edit
/// freely; enforcement lives here in the adapter, not in the core.
const SCRIPT_DENYLIST: &[&str] = &[
    "fetch(",
    "XMLHttpRequest",
    "WebSocket(",
    "eval(",
    "Function(",
    "localStorage",
    "sessionStorage",
    "document.cookie",
    "import(",
    "require(",
    "process.",
];

fn denied_pattern(script: &str) -> Option<&'static str> {
    SCRIPT_DENYLIST
        .iter()
        .copied()
        .find(|pattern| script.contains(pattern))
}

/// POST /execute-script
pub async fn execute_script(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    let Some(script) = payload.get("script").and_then(Value::as_str) else {
        return response::bad_request("missing script");
    };
    if let Some(pattern) = denied_pattern(script) {
        return response::bad_request(format!("script contains a forbidden pattern: {pattern}"));
    }
    relay_request(&state, &client_id, kinds::SCRIPT, "execute-script", payload).await
}

// ---------------------------------------------------------------------------
// dnd5e actor operations
// ---------------------------------------------------------------------------

/// POST /dnd5e/use-item
pub async fn dnd5e_use_item(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_field(&payload, "actorUuid") {
        return resp;
    }
    if !payload.contains_key("itemUuid") && !payload.contains_key("itemName") {
        return response::bad_request("item use needs an itemUuid or an itemName");
    }
    relay_request(&state, &client_id, kinds::DND5E, "dnd5e-use-item", payload).await
}

/// POST /dnd5e/apply-damage
pub async fn dnd5e_apply_damage(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    for field in ["actorUuid", "amount"] {
        if let Err(resp) = require_field(&payload, field) {
            return resp;
        }
    }
    relay_request(&state, &client_id, kinds::DND5E, "dnd5e-apply-damage", payload).await
}

/// POST /dnd5e/rest
pub async fn dnd5e_rest(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (client_id, payload) = match body_payload(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_field(&payload, "actorUuid") {
        return resp;
    }
    relay_request(&state, &client_id, kinds::DND5E, "dnd5e-rest", payload).await
}
