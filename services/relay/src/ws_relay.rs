//! `/relay` WebSocket endpoint: join handshake and session loops.
//!
//! The first frame must be a `hello` within the grace period.  After a
//! successful join the socket splits into a reader (this handler) and a
//! writer task draining the client's bounded outbound queue.  Both exits
//! funnel into the registry teardown, guarded by the connection sequence so
//! a preempted connection cannot tear down its successor.

use crate::config::DirectoryMode;
use crate::directory::owner_key;
use crate::registry::{CloseReason, OutboundFrame, Registration, SendOutcome};
use crate::router;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{types, Envelope, Hello};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELLO_GRACE: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn ws_relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state))
}

async fn handle_relay_socket(mut socket: WebSocket, state: AppState) {
    let hello = match recv_hello(&mut socket).await {
        Ok(hello) => hello,
        Err(reason) => {
            send_ws_error(&mut socket, reason).await;
            return;
        }
    };

    let principal = match state.auth.authorize(&hello.api_key).await {
        Ok(principal) => principal,
        Err(reject) => {
            warn!(client_id = %hello.client_id, "rejected join: {}", reject.message);
            send_ws_error(&mut socket, &reject.message).await;
            return;
        }
    };

    // A prior owner on a different replica is preempted over the
    // back-channel; the latest join wins even if the peer never answers.
    if state.config.directory_mode == DirectoryMode::Shared {
        match state.directory.get(&owner_key(&hello.client_id)).await {
            Ok(Some(owner)) if owner != state.config.replica_id => {
                info!(
                    client_id = %hello.client_id,
                    prior_owner = %owner,
                    "preempting prior owner"
                );
                router::send_preempt(&state, &owner, &hello.client_id).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %hello.client_id, error = %e, "owner lookup failed during join");
            }
        }
    }

    // A live local entry under the same id is closed inside insert.
    let registration = state
        .registry
        .insert(
            &hello.client_id,
            &principal.api_key_hash,
            hello.metadata.clone(),
            state.config.outbound_queue_capacity,
        )
        .await;
    state
        .registry
        .publish(&hello.client_id, &principal.api_key_hash)
        .await;

    let Registration {
        entry,
        outbound_rx,
        close_rx,
        close_signal,
    } = registration;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, close_signal));

    let mut ack = Envelope::new(types::JOINED);
    ack.insert("clientId", json!(hello.client_id));
    ack.insert("replicaId", json!(state.config.replica_id));
    if state.registry.send(&hello.client_id, ack).await != SendOutcome::Ok {
        state
            .registry
            .teardown(&hello.client_id, entry.conn_seq, CloseReason::ProtocolError)
            .await;
        writer.abort();
        return;
    }
    info!(client_id = %hello.client_id, "client joined");

    let reason = read_loop(stream, &state, &entry, close_rx).await;
    state
        .registry
        .teardown(&hello.client_id, entry.conn_seq, reason)
        .await;
    writer.abort();
    info!(
        client_id = %hello.client_id,
        reason = reason.as_str(),
        "client session ended"
    );
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn recv_hello(socket: &mut WebSocket) -> Result<Hello, &'static str> {
    match tokio::time::timeout(HELLO_GRACE, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => Hello::from_envelope(&envelope).map_err(|rejection| rejection.reason()),
            Err(_) => Err("first message is not a valid JSON envelope"),
        },
        Ok(Some(Ok(_))) => Err("first message must be a text hello frame"),
        Ok(_) => Err("connection closed before hello"),
        Err(_) => Err("timed out waiting for hello"),
    }
}

async fn send_ws_error(socket: &mut WebSocket, message: &str) {
    let mut envelope = Envelope::new("error");
    envelope.insert("message", json!(message));
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = socket.send(Message::Text(json)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

// ---------------------------------------------------------------------------
// Session loops
// ---------------------------------------------------------------------------

/// Single writer per socket: envelopes to one client keep send order on the
/// wire.  A write stuck past the timeout signals the close path -- the
/// relay never waits indefinitely for a stuck peer.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    close_signal: mpsc::Sender<CloseReason>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let write = match frame {
            OutboundFrame::Envelope(envelope) => match serde_json::to_string(&envelope) {
                Ok(json) => {
                    tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(json))).await
                }
                Err(e) => {
                    warn!(error = %e, "dropping unserializable outbound envelope");
                    continue;
                }
            },
            OutboundFrame::Ping => {
                tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await
            }
            OutboundFrame::Close => {
                let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
                break;
            }
        };
        match write {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                let _ = close_signal.try_send(CloseReason::WriteStalled);
                break;
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    entry: &Arc<crate::registry::ClientEntry>,
    mut close_rx: mpsc::Receiver<CloseReason>,
) -> CloseReason {
    loop {
        tokio::select! {
            reason = close_rx.recv() => {
                return reason.unwrap_or(CloseReason::Explicit);
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    entry.touch();
                    match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => dispatch_inbound(state, entry, envelope).await,
                        Err(e) => {
                            warn!(
                                client_id = %entry.client_id,
                                error = %e,
                                "closing client after unparseable frame"
                            );
                            return CloseReason::ProtocolError;
                        }
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Ping(_) | Message::Binary(_))) => {
                    entry.touch();
                }
                Some(Ok(Message::Close(_))) | None => return CloseReason::Remote,
                Some(Err(e)) => {
                    debug!(client_id = %entry.client_id, error = %e, "socket error");
                    return CloseReason::Remote;
                }
            }
        }
    }
}

/// Tokened replies go to the correlator; untokened frames are events for
/// the subscriber pool.
async fn dispatch_inbound(
    state: &AppState,
    entry: &Arc<crate::registry::ClientEntry>,
    envelope: Envelope,
) {
    match envelope.request_id.clone() {
        Some(token) => {
            state.correlator.complete(&token, envelope).await;
        }
        None => {
            state
                .registry
                .dispatch_event(&entry.client_id, envelope)
                .await;
        }
    }
}
