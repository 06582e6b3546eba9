//! Client registry: the per-replica authoritative table of live WebSocket
//! clients.
//!
//! Exactly one replica holds an entry for a given client id at any instant;
//! the registry publishes that ownership to the directory on join and
//! withdraws it on close.  All close paths (remote close, protocol error,
//! liveness eviction, explicit close, preemption) funnel through one
//! teardown that fails pending requests, withdraws ownership, and fires
//! eviction callbacks.

use crate::correlator::Correlator;
use crate::directory::{self, Directory};
use chrono::{DateTime, Utc};
use relay_protocol::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const EVENT_QUEUE_CAPACITY: usize = 64;
const EVENT_WORKERS: usize = 4;

/// Outcome of an outbound enqueue.  `send` never blocks on network I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    NotFound,
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Remote,
    ProtocolError,
    Evicted,
    Preempted,
    Explicit,
    WriteStalled,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::ProtocolError => "protocol-error",
            Self::Evicted => "evicted",
            Self::Preempted => "preempted",
            Self::Explicit => "explicit",
            Self::WriteStalled => "write-stalled",
        }
    }
}

/// Frames the per-client writer task drains to the socket.
#[derive(Debug)]
pub enum OutboundFrame {
    Envelope(Envelope),
    Ping,
    Close,
}

pub struct ClientEntry {
    pub client_id: String,
    pub api_key_hash: String,
    pub joined_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Connection sequence number: teardown of a preempted connection must
    /// not remove its successor under the same client id.
    pub conn_seq: u64,
    last_seen_ms: AtomicI64,
    outbound: mpsc::Sender<OutboundFrame>,
    close_tx: mpsc::Sender<CloseReason>,
}

impl ClientEntry {
    /// Any inbound frame counts as liveness, not just pongs.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_seen_ms();
        Duration::from_millis(idle_ms.max(0) as u64)
    }
}

/// Everything the connection handler needs after a successful join.
pub struct Registration {
    pub entry: Arc<ClientEntry>,
    pub outbound_rx: mpsc::Receiver<OutboundFrame>,
    pub close_rx: mpsc::Receiver<CloseReason>,
    /// Clone handed to the writer task so a stalled write can trigger the
    /// close path.
    pub close_signal: mpsc::Sender<CloseReason>,
}

pub type EventHandler = Arc<dyn Fn(&str, &Envelope) + Send + Sync>;
pub type EvictionHandler = Arc<dyn Fn(&str, CloseReason) + Send + Sync>;

pub struct Registry {
    replica_id: String,
    clients: RwLock<HashMap<String, Arc<ClientEntry>>>,
    subscribers: Arc<RwLock<HashMap<String, Vec<EventHandler>>>>,
    eviction_handlers: RwLock<Vec<EvictionHandler>>,
    events_tx: mpsc::Sender<(String, Envelope)>,
    conn_counter: AtomicU64,
    correlator: Arc<Correlator>,
    directory: Arc<dyn Directory>,
    directory_ttl: Duration,
}

impl Registry {
    pub fn new(
        replica_id: &str,
        correlator: Arc<Correlator>,
        directory: Arc<dyn Directory>,
        directory_ttl: Duration,
    ) -> Self {
        let (events_tx, events_rx) =
            mpsc::channel::<(String, Envelope)>(EVENT_QUEUE_CAPACITY);
        let subscribers: Arc<RwLock<HashMap<String, Vec<EventHandler>>>> = Arc::default();

        // Bounded worker pool for untokened events: slow subscriber
        // handlers must not block the socket readers.
        let events_rx = Arc::new(Mutex::new(events_rx));
        for _ in 0..EVENT_WORKERS {
            let events_rx = Arc::clone(&events_rx);
            let subscribers = Arc::clone(&subscribers);
            tokio::spawn(async move {
                loop {
                    let item = { events_rx.lock().await.recv().await };
                    let Some((client_id, envelope)) = item else {
                        break;
                    };
                    let handlers = {
                        subscribers
                            .read()
                            .await
                            .get(&envelope.message_type)
                            .cloned()
                            .unwrap_or_default()
                    };
                    for handler in handlers {
                        handler(&client_id, &envelope);
                    }
                }
            });
        }

        Self {
            replica_id: replica_id.to_owned(),
            clients: RwLock::new(HashMap::new()),
            subscribers,
            eviction_handlers: RwLock::new(Vec::new()),
            events_tx,
            conn_counter: AtomicU64::new(0),
            correlator,
            directory,
            directory_ttl,
        }
    }

    // -----------------------------------------------------------------------
    // Table mutations
    // -----------------------------------------------------------------------

    /// Insert a freshly-joined client.  A live entry under the same id is
    /// closed first: latest join wins.
    pub async fn insert(
        &self,
        client_id: &str,
        api_key_hash: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
        queue_capacity: usize,
    ) -> Registration {
        self.close(client_id, CloseReason::Preempted).await;

        let conn_seq = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity);
        let (close_tx, close_rx) = mpsc::channel(1);
        let entry = Arc::new(ClientEntry {
            client_id: client_id.to_owned(),
            api_key_hash: api_key_hash.to_owned(),
            joined_at: Utc::now(),
            metadata,
            conn_seq,
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            outbound,
            close_tx: close_tx.clone(),
        });
        self.clients
            .write()
            .await
            .insert(client_id.to_owned(), Arc::clone(&entry));
        Registration {
            entry,
            outbound_rx,
            close_rx,
            close_signal: close_tx,
        }
    }

    /// Close whatever connection currently holds `client_id`.  Idempotent:
    /// the second call finds nothing and returns false.
    pub async fn close(&self, client_id: &str, reason: CloseReason) -> bool {
        let entry = self.clients.write().await.remove(client_id);
        match entry {
            Some(entry) => {
                self.finish_teardown(&entry, reason).await;
                true
            }
            None => false,
        }
    }

    /// Connection-scoped close used by the socket handler on exit: only
    /// removes the entry if it still belongs to that connection.
    pub async fn teardown(&self, client_id: &str, conn_seq: u64, reason: CloseReason) -> bool {
        let entry = {
            let mut map = self.clients.write().await;
            match map.get(client_id) {
                Some(entry) if entry.conn_seq == conn_seq => map.remove(client_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                self.finish_teardown(&entry, reason).await;
                true
            }
            None => false,
        }
    }

    async fn finish_teardown(&self, entry: &Arc<ClientEntry>, reason: CloseReason) {
        // Wake the connection tasks; both sends are best-effort since the
        // teardown may already have been initiated from their side.
        let _ = entry.close_tx.try_send(reason);
        let _ = entry.outbound.try_send(OutboundFrame::Close);

        let swept = self.correlator.fail_client(&entry.client_id).await;
        if swept > 0 {
            debug!(
                client_id = %entry.client_id,
                swept,
                "failed pending requests for closed client"
            );
        }
        self.unpublish(&entry.client_id, &entry.api_key_hash).await;

        let handlers = self.eviction_handlers.read().await.clone();
        for handler in &handlers {
            handler(&entry.client_id, reason);
        }
        info!(client_id = %entry.client_id, reason = reason.as_str(), "client closed");
    }

    // -----------------------------------------------------------------------
    // Lookups and outbound delivery
    // -----------------------------------------------------------------------

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientEntry>> {
        self.clients.read().await.get(client_id).cloned()
    }

    pub async fn list_for(&self, api_key_hash: &str) -> Vec<Arc<ClientEntry>> {
        self.clients
            .read()
            .await
            .values()
            .filter(|entry| entry.api_key_hash == api_key_hash)
            .cloned()
            .collect()
    }

    pub async fn entries(&self) -> Vec<Arc<ClientEntry>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Enqueue an envelope for outbound delivery.  Non-blocking: a full
    /// queue is the backpressure signal surfaced to the REST caller.
    pub async fn send(&self, client_id: &str, envelope: Envelope) -> SendOutcome {
        let entry = self.get(client_id).await;
        match entry {
            None => SendOutcome::NotFound,
            Some(entry) => match entry.outbound.try_send(OutboundFrame::Envelope(envelope)) {
                Ok(()) => SendOutcome::Ok,
                Err(TrySendError::Full(_)) => SendOutcome::SendFailed,
                Err(TrySendError::Closed(_)) => SendOutcome::NotFound,
            },
        }
    }

    /// Enqueue a protocol ping; dropped silently when the queue is full.
    pub async fn ping(&self, client_id: &str) {
        if let Some(entry) = self.get(client_id).await {
            let _ = entry.outbound.try_send(OutboundFrame::Ping);
        }
    }

    // -----------------------------------------------------------------------
    // Events and callbacks
    // -----------------------------------------------------------------------

    /// Register a handler for every inbound envelope of `message_type`
    /// that carries no request token.
    pub async fn subscribe<F>(&self, message_type: &str, handler: F)
    where
        F: Fn(&str, &Envelope) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .await
            .entry(message_type.to_owned())
            .or_default()
            .push(Arc::new(handler));
    }

    pub async fn on_eviction<F>(&self, handler: F)
    where
        F: Fn(&str, CloseReason) + Send + Sync + 'static,
    {
        self.eviction_handlers.write().await.push(Arc::new(handler));
    }

    /// Hand an untokened inbound envelope to the subscriber pool.  Never
    /// blocks the reader; a saturated pool drops the event.
    pub async fn dispatch_event(&self, client_id: &str, envelope: Envelope) {
        if self
            .events_tx
            .try_send((client_id.to_owned(), envelope))
            .is_err()
        {
            warn!(client_id = %client_id, "subscriber pool saturated, dropping inbound event");
        }
    }

    // -----------------------------------------------------------------------
    // Directory publication
    // -----------------------------------------------------------------------

    pub async fn publish(&self, client_id: &str, api_key_hash: &str) {
        if let Err(e) = self
            .directory
            .set(
                &directory::owner_key(client_id),
                &self.replica_id,
                self.directory_ttl,
            )
            .await
        {
            warn!(
                client_id = %client_id,
                error = %e,
                "failed to publish ownership; peers may not route to this client"
            );
        }
        if let Err(e) = self
            .directory
            .set_add(&directory::key_clients_key(api_key_hash), client_id)
            .await
        {
            warn!(client_id = %client_id, error = %e, "failed to update key index");
        }
    }

    async fn unpublish(&self, client_id: &str, api_key_hash: &str) {
        // Only withdraw ownership this replica still holds; a preempting
        // replica may have overwritten the record already.
        match self.directory.get(&directory::owner_key(client_id)).await {
            Ok(Some(owner)) if owner == self.replica_id => {
                if let Err(e) = self.directory.delete(&directory::owner_key(client_id)).await {
                    warn!(client_id = %client_id, error = %e, "failed to withdraw ownership");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "ownership lookup failed during teardown");
            }
        }
        if let Err(e) = self
            .directory
            .set_remove(&directory::key_clients_key(api_key_hash), client_id)
            .await
        {
            warn!(client_id = %client_id, error = %e, "failed to update key index");
        }
    }

    /// Re-assert directory records before their TTL lapses; called from the
    /// liveness sweep.
    pub async fn refresh_ownership(&self) {
        for entry in self.entries().await {
            self.publish(&entry.client_id, &entry.api_key_hash).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use serde_json::Map;

    fn make_registry() -> (Registry, Arc<Correlator>, Arc<MemoryDirectory>) {
        let correlator = Arc::new(Correlator::new());
        let directory = Arc::new(MemoryDirectory::new());
        let registry = Registry::new(
            "R1",
            Arc::clone(&correlator),
            directory.clone() as Arc<dyn Directory>,
            Duration::from_secs(35),
        );
        (registry, correlator, directory)
    }

    #[tokio::test]
    async fn send_reaches_capacity_exactly_then_fails_deterministically() {
        let (registry, _, _) = make_registry();
        let _registration = registry
            .insert("foundry-A", "hash", Map::new(), 2)
            .await;

        // No writer is draining, so capacity is the hard boundary.
        assert_eq!(
            registry.send("foundry-A", Envelope::new("a")).await,
            SendOutcome::Ok
        );
        assert_eq!(
            registry.send("foundry-A", Envelope::new("b")).await,
            SendOutcome::Ok
        );
        assert_eq!(
            registry.send("foundry-A", Envelope::new("c")).await,
            SendOutcome::SendFailed
        );

        assert_eq!(
            registry.send("nobody", Envelope::new("d")).await,
            SendOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn client_entries_carry_the_join_model() {
        let (registry, _, _) = make_registry();
        let mut metadata = Map::new();
        metadata.insert("origin".to_owned(), serde_json::json!("https://vtt.example"));
        let _registration = registry.insert("foundry-A", "hash-1", metadata, 8).await;

        let entry = registry.get("foundry-A").await.expect("entry");
        assert_eq!(entry.client_id, "foundry-A");
        assert_eq!(entry.api_key_hash, "hash-1");
        assert_eq!(
            entry.metadata.get("origin"),
            Some(&serde_json::json!("https://vtt.example"))
        );
        assert!(entry.joined_at <= Utc::now());

        let before = entry.last_seen_ms();
        tokio::time::sleep(Duration::from_millis(5)).await;
        entry.touch();
        assert!(entry.last_seen_ms() >= before);
        assert!(entry.idle() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sweeps_pending_requests() {
        let (registry, correlator, _) = make_registry();
        let _registration = registry
            .insert("foundry-A", "hash", Map::new(), 8)
            .await;
        let (_token, rx) = correlator
            .begin("foundry-A", "search", Duration::from_secs(10))
            .await;

        assert!(registry.close("foundry-A", CloseReason::Explicit).await);
        assert!(matches!(
            rx.await,
            Ok(crate::correlator::Completion::ClientGone)
        ));

        // Second close finds nothing.
        assert!(!registry.close("foundry-A", CloseReason::Explicit).await);
        assert_eq!(
            registry.send("foundry-A", Envelope::new("x")).await,
            SendOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn teardown_of_a_preempted_connection_spares_its_successor() {
        let (registry, _, _) = make_registry();
        let first = registry.insert("foundry-A", "hash", Map::new(), 8).await;
        let second = registry.insert("foundry-A", "hash", Map::new(), 8).await;
        assert_ne!(first.entry.conn_seq, second.entry.conn_seq);

        // The preempted connection's exit path must not remove the new one.
        assert!(
            !registry
                .teardown("foundry-A", first.entry.conn_seq, CloseReason::Remote)
                .await
        );
        let current = registry.get("foundry-A").await.expect("successor lives");
        assert_eq!(current.conn_seq, second.entry.conn_seq);

        assert!(
            registry
                .teardown("foundry-A", second.entry.conn_seq, CloseReason::Remote)
                .await
        );
        assert!(registry.get("foundry-A").await.is_none());
    }

    #[tokio::test]
    async fn list_for_filters_by_api_key_hash() {
        let (registry, _, _) = make_registry();
        let _a = registry.insert("foundry-A", "hash-1", Map::new(), 8).await;
        let _b = registry.insert("foundry-B", "hash-1", Map::new(), 8).await;
        let _c = registry.insert("foundry-C", "hash-2", Map::new(), 8).await;

        let mut ids: Vec<String> = registry
            .list_for("hash-1")
            .await
            .into_iter()
            .map(|entry| entry.client_id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["foundry-A", "foundry-B"]);
    }

    #[tokio::test]
    async fn publish_and_teardown_keep_the_directory_consistent() {
        let (registry, _, directory) = make_registry();
        let _registration = registry
            .insert("foundry-A", "hash-1", Map::new(), 8)
            .await;
        registry.publish("foundry-A", "hash-1").await;

        assert_eq!(
            directory.get("owner:foundry-A").await.expect("get"),
            Some("R1".to_owned())
        );
        assert_eq!(
            directory.set_members("key-clients:hash-1").await.expect("members"),
            vec!["foundry-A"]
        );

        registry.close("foundry-A", CloseReason::Explicit).await;
        assert_eq!(directory.get("owner:foundry-A").await.expect("get"), None);
        assert!(directory
            .set_members("key-clients:hash-1")
            .await
            .expect("members")
            .is_empty());
    }

    #[tokio::test]
    async fn teardown_does_not_withdraw_ownership_taken_by_a_peer() {
        let (registry, _, directory) = make_registry();
        let _registration = registry
            .insert("foundry-A", "hash-1", Map::new(), 8)
            .await;
        registry.publish("foundry-A", "hash-1").await;

        // A newer join on R2 has already overwritten the record.
        directory
            .set("owner:foundry-A", "R2", Duration::from_secs(35))
            .await
            .expect("set");

        registry.close("foundry-A", CloseReason::Preempted).await;
        assert_eq!(
            directory.get("owner:foundry-A").await.expect("get"),
            Some("R2".to_owned())
        );
    }

    #[tokio::test]
    async fn subscribers_receive_untokened_events_via_the_pool() {
        let (registry, _, _) = make_registry();
        let seen: Arc<std::sync::Mutex<Vec<(String, String)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        registry
            .subscribe("roll-event", move |client_id, envelope| {
                sink.lock()
                    .expect("lock")
                    .push((client_id.to_owned(), envelope.message_type.clone()));
            })
            .await;

        let mut event = Envelope::new("roll-event");
        event.insert("total", serde_json::json!(17));
        registry.dispatch_event("foundry-A", event).await;
        // An event type nobody subscribed to is dropped harmlessly.
        registry
            .dispatch_event("foundry-A", Envelope::new("chat-event"))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !seen.lock().expect("lock").is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "subscriber never ran"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            seen.lock().expect("lock")[0],
            ("foundry-A".to_owned(), "roll-event".to_owned())
        );
    }

    #[tokio::test]
    async fn eviction_callbacks_fire_with_the_close_reason() {
        let (registry, _, _) = make_registry();
        let seen: Arc<std::sync::Mutex<Vec<(String, CloseReason)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        registry
            .on_eviction(move |client_id, reason| {
                sink.lock().expect("lock").push((client_id.to_owned(), reason));
            })
            .await;

        let _registration = registry
            .insert("foundry-A", "hash", Map::new(), 8)
            .await;
        registry.close("foundry-A", CloseReason::Evicted).await;

        let calls = seen.lock().expect("lock").clone();
        assert_eq!(
            calls,
            vec![("foundry-A".to_owned(), CloseReason::Evicted)]
        );
    }
}
