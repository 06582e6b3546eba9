//! Request router: decides per REST request between handling locally,
//! forwarding to the peer replica that owns the target client, and
//! rejecting.
//!
//! Forwarding is best-effort: any proxy failure falls back to local
//! handling, which produces a clean client-not-found instead of a 502
//! storm.  A request that already carries the forwarding header is never
//! forwarded again.

use crate::config::DirectoryMode;
use crate::directory::{owner_key, replica_addr_key};
use crate::http::response;
use crate::registry::CloseReason;
use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{request::Parts, HeaderName, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use relay_protocol::PreemptNotice;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Names the originating replica on forwarded requests; its presence is the
/// loop guard.
pub const FORWARDED_FROM: &str = "x-forwarded-from";

const PROXY_TIMEOUT: Duration = Duration::from_secs(10);
const PREEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Uploads cap the relayed body; everything else is far below this.
pub const MAX_BODY_BYTES: usize = 250 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub async fn route_or_forward(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    // Forwarded requests are terminal here: handle locally whatever happens.
    if req.headers().contains_key(FORWARDED_FROM) {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return response::bad_request("request body exceeds the size limit"),
    };

    let client_id = client_id_from_query(parts.uri.query()).or_else(|| client_id_from_json(&bytes));

    // No target client advertised: purely local endpoint.
    let Some(client_id) = client_id else {
        return next.run(rebuild(&parts, &bytes)).await;
    };

    if state.registry.get(&client_id).await.is_some() {
        return next.run(rebuild(&parts, &bytes)).await;
    }

    if state.config.directory_mode != DirectoryMode::Shared {
        return next.run(rebuild(&parts, &bytes)).await;
    }

    let owner = match state.directory.get(&owner_key(&client_id)).await {
        Ok(owner) => owner,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "directory lookup failed, handling locally");
            None
        }
    };
    match owner {
        Some(peer) if peer != state.config.replica_id => {
            match forward(&state, &parts, &bytes, &peer).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        client_id = %client_id,
                        peer = %peer,
                        error = %e,
                        "forwarding failed, falling back to local handling"
                    );
                    next.run(rebuild(&parts, &bytes)).await
                }
            }
        }
        // Unknown owner, or a stale record naming this replica: the adapter
        // will produce client-not-found.
        _ => next.run(rebuild(&parts, &bytes)).await,
    }
}

fn rebuild(parts: &Parts, bytes: &Bytes) -> Request {
    Request::from_parts(parts.clone(), Body::from(bytes.clone()))
}

pub(crate) fn client_id_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "clientId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

pub(crate) fn client_id_from_json(bytes: &Bytes) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice::<Value>(bytes)
        .ok()?
        .get("clientId")?
        .as_str()
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

// ---------------------------------------------------------------------------
// Proxying
// ---------------------------------------------------------------------------

async fn forward(
    state: &AppState,
    parts: &Parts,
    body: &Bytes,
    peer: &str,
) -> Result<Response, String> {
    let peer_addr = resolve_peer_addr(state, peer).await;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let url = format!("http://{peer_addr}/proxy/{peer}{path_and_query}");
    debug!(url = %url, "forwarding request to owning replica");

    let mut headers = parts.headers.clone();
    for name in hop_by_hop_headers() {
        headers.remove(name);
    }
    headers.insert(
        HeaderName::from_static(FORWARDED_FROM),
        state
            .config
            .replica_id
            .parse()
            .map_err(|_| "replica id is not a valid header value".to_owned())?,
    );

    let upstream = state
        .http_client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body.to_vec())
        .timeout(PROXY_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    // Relay status, headers, and body verbatim.
    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    for name in hop_by_hop_headers() {
        response_headers.remove(name);
    }
    let body = upstream.bytes().await.map_err(|e| e.to_string())?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

async fn resolve_peer_addr(state: &AppState, replica_id: &str) -> String {
    match state.directory.get(&replica_addr_key(replica_id)).await {
        Ok(Some(addr)) => addr,
        Ok(None) => state.config.peer_fallback_addr(replica_id),
        Err(e) => {
            warn!(replica_id = %replica_id, error = %e, "peer address lookup failed, using fallback scheme");
            state.config.peer_fallback_addr(replica_id)
        }
    }
}

fn hop_by_hop_headers() -> [HeaderName; 10] {
    [
        HeaderName::from_static("connection"),
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailer"),
        HeaderName::from_static("transfer-encoding"),
        HeaderName::from_static("upgrade"),
        HeaderName::from_static("host"),
        HeaderName::from_static("content-length"),
    ]
}

// ---------------------------------------------------------------------------
// Preemption back-channel
// ---------------------------------------------------------------------------

/// Tell `peer` that a newer join took over `client_id`.  Preemption is
/// authoritative: a refusal or an unreachable peer only delays the new join
/// by the bounded timeout, it never blocks it (crash-without-close).
pub async fn send_preempt(state: &AppState, peer: &str, client_id: &str) {
    let peer_addr = resolve_peer_addr(state, peer).await;
    let url = format!("http://{peer_addr}/internal/preempt");
    let notice = PreemptNotice {
        client_id: client_id.to_owned(),
        replica_id: state.config.replica_id.clone(),
    };
    match state
        .http_client
        .post(&url)
        .header(FORWARDED_FROM, &state.config.replica_id)
        .json(&notice)
        .timeout(PREEMPT_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            debug!(client_id = %client_id, peer = %peer, "peer released preempted client");
        }
        Ok(resp) => {
            warn!(
                client_id = %client_id,
                peer = %peer,
                status = %resp.status(),
                "peer did not confirm preemption, proceeding"
            );
        }
        Err(e) => {
            warn!(
                client_id = %client_id,
                peer = %peer,
                error = %e,
                "peer unreachable for preemption, proceeding"
            );
        }
    }
}

/// Internal-network endpoint: release a client this replica owns because a
/// newer join claimed it elsewhere.
pub async fn preempt_handler(
    State(state): State<AppState>,
    Json(notice): Json<PreemptNotice>,
) -> impl IntoResponse {
    info!(
        client_id = %notice.client_id,
        new_owner = %notice.replica_id,
        "received preempt notice"
    );
    state
        .registry
        .close(&notice.client_id, CloseReason::Preempted)
        .await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_parses_from_query_strings() {
        assert_eq!(
            client_id_from_query(Some("clientId=foundry-A&query=stu")),
            Some("foundry-A".to_owned())
        );
        assert_eq!(
            client_id_from_query(Some("query=stu&clientId=foundry%2DA")),
            Some("foundry-A".to_owned())
        );
        assert_eq!(client_id_from_query(Some("query=stu")), None);
        assert_eq!(client_id_from_query(Some("clientId=")), None);
        assert_eq!(client_id_from_query(None), None);
    }

    #[test]
    fn client_id_parses_from_json_bodies() {
        assert_eq!(
            client_id_from_json(&Bytes::from_static(
                br#"{"clientId":"foundry-A","formula":"1d20"}"#
            )),
            Some("foundry-A".to_owned())
        );
        assert_eq!(
            client_id_from_json(&Bytes::from_static(br#"{"formula":"1d20"}"#)),
            None
        );
        assert_eq!(client_id_from_json(&Bytes::from_static(b"not json")), None);
        assert_eq!(client_id_from_json(&Bytes::new()), None);
    }

    #[test]
    fn hop_by_hop_headers_cover_host_and_connection() {
        let headers = hop_by_hop_headers();
        let names: Vec<&str> = headers.iter().map(|n| n.as_str()).collect();
        assert!(names.contains(&"host"));
        assert!(names.contains(&"connection"));
        assert!(names.contains(&"transfer-encoding"));
        assert!(!names.contains(&"x-api-key"));
    }
}
