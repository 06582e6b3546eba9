//! Filesystem endpoints: list, download, upload.
//!
//! Uploads accept either a JSON body carrying a base64 data URL or a raw
//! binary body with query parameters.  Binary content crosses the
//! WebSocket as a base64 data URL inside the envelope; downloads decode it
//! back to bytes at this boundary.  The core never re-encodes payloads.

use crate::http::api::{body_payload, relay_exchange, relay_request};
use crate::http::response;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use relay_protocol::{kinds, Envelope};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Upload size limit.
pub const MAX_FILE_BYTES: usize = 250 * 1024 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    path: Option<String>,
}

/// GET /files
pub async fn list_files(State(state): State<AppState>, Query(params): Query<ListQuery>) -> Response {
    let mut payload = Map::new();
    if let Some(path) = params.path {
        payload.insert("path".to_owned(), json!(path));
    }
    relay_request(&state, &params.client_id, kinds::FILES, "list-files", payload).await
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    path: String,
}

/// GET /files/download
pub async fn download_file(
    State(state): State<AppState>,
    Query(params): Query<DownloadQuery>,
) -> Response {
    let mut payload = Map::new();
    payload.insert("path".to_owned(), json!(params.path));
    let reply = match relay_exchange(
        &state,
        &params.client_id,
        kinds::DOWNLOAD,
        "download-file",
        payload,
    )
    .await
    {
        Ok(reply) => reply,
        Err(resp) => return resp,
    };

    match decode_file_payload(&reply) {
        Some((bytes, mime)) => ([(header::CONTENT_TYPE, mime)], bytes).into_response(),
        // A reply without recognizable file content is passed through.
        None => (StatusCode::OK, Json(Value::Object(reply.payload))).into_response(),
    }
}

#[derive(Deserialize)]
pub struct UploadQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
    path: Option<String>,
    filename: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
}

/// POST /files/upload
pub async fn upload_file(
    State(state): State<AppState>,
    Query(params): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.len() > MAX_FILE_BYTES {
        return response::bad_request("file exceeds the 250 MB limit");
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    if is_json {
        let value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => return response::bad_request(format!("invalid JSON body: {e}")),
        };
        let (client_id, payload) = match body_payload(&value) {
            Ok(parts) => parts,
            Err(resp) => return resp,
        };
        for field in ["path", "fileData"] {
            if !payload.contains_key(field) {
                return response::bad_request(format!("missing {field}"));
            }
        }
        return relay_request(&state, &client_id, kinds::UPLOAD, "upload-file", payload).await;
    }

    // Raw binary upload: target and destination come from the query string.
    let Some(client_id) = params.client_id else {
        return response::bad_request("missing clientId");
    };
    let (Some(path), Some(filename)) = (params.path, params.filename) else {
        return response::bad_request("raw uploads require path and filename query parameters");
    };
    let mime = params.mime_type.unwrap_or_else(|| OCTET_STREAM.to_owned());
    let mut payload = Map::new();
    payload.insert("path".to_owned(), json!(path));
    payload.insert("filename".to_owned(), json!(filename));
    payload.insert(
        "fileData".to_owned(),
        json!(format!("data:{mime};base64,{}", BASE64.encode(&body))),
    );
    relay_request(&state, &client_id, kinds::UPLOAD, "upload-file", payload).await
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// File replies carry either a `fileData` base64 string (optionally a data
/// URL) or a `bytes` array of byte values.
fn decode_file_payload(reply: &Envelope) -> Option<(Vec<u8>, String)> {
    if let Some(data) = reply.get_str("fileData") {
        return decode_data_url(data);
    }
    if let Some(array) = reply.payload.get("bytes").and_then(Value::as_array) {
        let bytes: Option<Vec<u8>> = array
            .iter()
            .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect();
        let mime = reply
            .get_str("mimeType")
            .unwrap_or(OCTET_STREAM)
            .to_owned();
        return bytes.map(|bytes| (bytes, mime));
    }
    None
}

fn decode_data_url(data: &str) -> Option<(Vec<u8>, String)> {
    if let Some(rest) = data.strip_prefix("data:") {
        let (meta, encoded) = rest.split_once(',')?;
        let mime = meta.strip_suffix(";base64").unwrap_or(meta);
        let bytes = BASE64.decode(encoded).ok()?;
        let mime = if mime.is_empty() {
            OCTET_STREAM.to_owned()
        } else {
            mime.to_owned()
        };
        return Some((bytes, mime));
    }
    BASE64
        .decode(data)
        .ok()
        .map(|bytes| (bytes, OCTET_STREAM.to_owned()))
}
