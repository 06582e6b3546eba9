//! End-to-end: a newer join on another replica silently takes over the
//! client id.

use relay::config::{DirectoryMode, RelayConfig};
use relay::directory::{Directory, MemoryDirectory};
use relay::registry::CloseReason;
use relay::AppState;
use relay_test_utils::MockTableClient;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_replica(
    mut config: RelayConfig,
    directory: Arc<dyn Directory>,
) -> (SocketAddr, AppState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.advertise_addr = Some(addr.to_string());
    let state = AppState::new(config, directory);
    state.publish_replica_addr().await;
    let serve_state = state.clone();
    tokio::spawn(async move {
        axum::serve(listener, relay::build_router(serve_state))
            .await
            .unwrap();
    });
    (addr, state)
}

fn shared_config(replica_id: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.replica_id = replica_id.to_owned();
    config.directory_mode = DirectoryMode::Shared;
    config.api_keys = vec!["K1".to_owned()];
    config
}

async fn wait_for_client_gone(state: &AppState, client_id: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if state.registry.get(client_id).await.is_none() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{client_id} still registered after {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_owner(
    directory: &MemoryDirectory,
    client_id: &str,
    expected: &str,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let owner = directory
            .get(&format!("owner:{client_id}"))
            .await
            .expect("directory get");
        if owner.as_deref() == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "owner of {client_id} never became {expected}; last={owner:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_second_join_on_another_replica_preempts_the_first() {
    let directory = Arc::new(MemoryDirectory::new());
    let (addr1, state1) =
        start_replica(shared_config("R1"), directory.clone() as Arc<dyn Directory>).await;
    let (addr2, state2) =
        start_replica(shared_config("R2"), directory.clone() as Arc<dyn Directory>).await;

    let evictions: Arc<std::sync::Mutex<Vec<(String, CloseReason)>>> = Arc::default();
    let sink = Arc::clone(&evictions);
    state1
        .registry
        .on_eviction(move |client_id, reason| {
            sink.lock().unwrap().push((client_id.to_owned(), reason));
        })
        .await;

    let mut ws1 = MockTableClient::join(&format!("ws://{addr1}/relay"), "foundry-A", "K1")
        .await
        .unwrap();
    wait_for_owner(&directory, "foundry-A", "R1", Duration::from_secs(2)).await;

    // Leave a request pending on R1 so the sweep has something to fail.
    let http = reqwest::Client::new();
    let pending = tokio::spawn(async move {
        http.get(format!("http://{addr1}/entity"))
            .query(&[("clientId", "foundry-A"), ("uuid", "Actor.U")])
            .header("x-api-key", "K1")
            .send()
            .await
            .unwrap()
    });
    let _command = ws1.recv_until("get-entity").await.unwrap();

    // Same client id, same key, different replica: latest join wins.
    let _ws2 = MockTableClient::join(&format!("ws://{addr2}/relay"), "foundry-A", "K1")
        .await
        .unwrap();

    wait_for_client_gone(&state1, "foundry-A", Duration::from_secs(3)).await;
    wait_for_owner(&directory, "foundry-A", "R2", Duration::from_secs(3)).await;
    assert!(state2.registry.get("foundry-A").await.is_some());

    // The in-flight request on R1 completed with client-disconnected.
    let response = pending.await.unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "CLIENT_DISCONNECTED");

    let calls = evictions.lock().unwrap().clone();
    assert!(
        calls.contains(&("foundry-A".to_owned(), CloseReason::Preempted)),
        "eviction callbacks were {calls:?}"
    );
}

#[tokio::test]
async fn test_rejoin_on_the_same_replica_replaces_the_entry() {
    let directory = Arc::new(MemoryDirectory::new());
    let (addr, state) =
        start_replica(shared_config("R1"), directory.clone() as Arc<dyn Directory>).await;

    let _ws1 = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-A", "K1")
        .await
        .unwrap();
    let first_seq = state
        .registry
        .get("foundry-A")
        .await
        .expect("first join")
        .conn_seq;

    let mut ws2 = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-A", "K1")
        .await
        .unwrap();
    let second_seq = state
        .registry
        .get("foundry-A")
        .await
        .expect("second join")
        .conn_seq;
    assert_ne!(first_seq, second_seq);

    // The replacement connection carries traffic; exactly one entry lives.
    assert_eq!(state.registry.len().await, 1);
    let http = reqwest::Client::new();
    let request = tokio::spawn(async move {
        http.get(format!("http://{addr}/search"))
            .query(&[("clientId", "foundry-A"), ("query", "q")])
            .header("x-api-key", "K1")
            .send()
            .await
            .unwrap()
    });
    let command = ws2.recv_until("perform-search").await.unwrap();
    let token = command.request_id.clone().expect("token");
    ws2.reply(&token, "search-result", serde_json::Map::new())
        .await
        .unwrap();
    assert_eq!(request.await.unwrap().status(), 200);
}
