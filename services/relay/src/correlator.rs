//! Request/response correlator.
//!
//! Every REST request that reaches a client becomes a pending entry keyed
//! by a request token.  The entry is removed under the map lock before its
//! completion is delivered, which makes the terminal event exactly-once:
//! reply, timeout, or client-gone, never more than one of them.

use chrono::Utc;
use relay_protocol::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// The single terminal event of a pending request.
#[derive(Debug)]
pub enum Completion {
    Reply(Envelope),
    Timeout,
    ClientGone,
}

struct Pending {
    client_id: String,
    kind: String,
    sink: oneshot::Sender<Completion>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending entry and arm its single-shot expiry timer.
    /// Returns the request token and the receiver the adapter awaits.
    pub async fn begin(
        &self,
        client_id: &str,
        kind: &str,
        deadline: Duration,
    ) -> (String, oneshot::Receiver<Completion>) {
        let token = mint_token(kind);
        let (sink, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            token.clone(),
            Pending {
                client_id: client_id.to_owned(),
                kind: kind.to_owned(),
                sink,
                timer: None,
            },
        );

        let timer = tokio::spawn({
            let pending = Arc::clone(&self.pending);
            let token = token.clone();
            async move {
                tokio::time::sleep(deadline).await;
                if let Some(entry) = pending.lock().await.remove(&token) {
                    debug!(token = %token, kind = %entry.kind, "pending request expired");
                    let _ = entry.sink.send(Completion::Timeout);
                }
            }
        });
        // The entry can already be gone if the reply raced the insert.
        match self.pending.lock().await.get_mut(&token) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        (token, rx)
    }

    /// Deliver a reply envelope to the waiting sink.  Returns false for
    /// unknown tokens (a reply to an already-terminated request), which are
    /// dropped.
    pub async fn complete(&self, token: &str, envelope: Envelope) -> bool {
        match self.pending.lock().await.remove(token) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                let _ = entry.sink.send(Completion::Reply(envelope));
                true
            }
            None => {
                debug!(token = %token, "dropping reply for unknown or expired token");
                false
            }
        }
    }

    /// Remove a pending entry without delivering a completion.  Used when
    /// the outbound send itself failed and the adapter answers directly.
    pub async fn cancel(&self, token: &str) {
        if let Some(entry) = self.pending.lock().await.remove(token) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Fail every pending entry addressed to a closed client.  Returns the
    /// number of entries swept.
    pub async fn fail_client(&self, client_id: &str) -> usize {
        let mut map = self.pending.lock().await;
        let tokens: Vec<String> = map
            .iter()
            .filter(|(_, entry)| entry.client_id == client_id)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &tokens {
            if let Some(entry) = map.remove(token) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                let _ = entry.sink.send(Completion::ClientGone);
            }
        }
        tokens.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Locally unique, monotonically-varying token: kind prefix, millisecond
/// timestamp, random suffix.  Tokens never leave the replica that minted
/// them, so replica-local uniqueness suffices.
fn mint_token(kind: &str) -> String {
    format!(
        "{}_{}_{:04x}",
        kind,
        Utc::now().timestamp_millis(),
        rand::random::<u16>()
    )
}
